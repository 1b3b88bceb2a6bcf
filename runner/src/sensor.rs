use crate::{config::ToolLocator, process::CallError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{path::Path, time::Duration};

static RE_TEMP: Lazy<Regex> = Lazy::new(|| Regex::new(r"([0-9]+\.[0-9])°C").unwrap());

// sensors answers from cached kernel state, a short leash is enough
const SENSOR_TIMEOUT: Duration = Duration::from_secs(2);

/// maximum temperature in celsius reported by `sensors` for `sensor_name`
pub fn max_temp(tools: &ToolLocator, sensor_name: &str, dir: &Path) -> Result<f32, CallError> {
    let output = tools.run(
        &tools.sensors,
        &[sensor_name.to_owned()],
        dir,
        SENSOR_TIMEOUT,
    )?;

    Ok(parse_max_temp(&output))
}

fn parse_max_temp(output: &str) -> f32 {
    RE_TEMP
        .captures_iter(output)
        .filter_map(|capture| capture[1].parse::<f32>().ok())
        .fold(0.0, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_hottest_reading() {
        let output = "\
k10temp-pci-00c3
Adapter: PCI adapter
Tctl:         +42.5°C
Tdie:         +61.3°C
Tccd1:        +48.8°C
";

        assert_eq!(parse_max_temp(output), 61.3);
    }

    #[test]
    fn no_readings_means_zero() {
        assert_eq!(parse_max_temp("Adapter: PCI adapter\n"), 0.0);
    }
}
