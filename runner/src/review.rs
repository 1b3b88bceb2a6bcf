use crate::config::ReviewConfig;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

// labels consulted for eligibility and priority
const LABEL_CODE_REVIEW: &str = "Code-Review";
const LABEL_VERIFIED: &str = "Verified";
const LABEL_PRESUBMIT_READY: &str = "Presubmit-Ready";
const LABEL_CI: &str = "CI";

const REVIEW_TAG: &str = "autogenerated:benchwatch";

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("review service request failed")]
    Http(#[from] Box<ureq::Error>),
    #[error("failed to read review service response")]
    Read(#[from] std::io::Error),
    #[error("failed to parse review service response")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountInfo {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LabelInfo {
    #[serde(default)]
    pub value: i32,
    #[serde(default)]
    pub approved: AccountInfo,
    #[serde(default)]
    pub recommended: AccountInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParentInfo {
    pub commit: String,
    #[serde(default)]
    pub subject: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommitInfo {
    #[serde(default)]
    pub committer: AccountInfo,
    #[serde(default)]
    pub parents: Vec<ParentInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RevisionInfo {
    #[serde(rename = "_number")]
    pub number: i64,
    #[serde(rename = "ref")]
    pub ref_name: String,
    #[serde(default)]
    pub commit: CommitInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageInfo {
    #[serde(rename = "_revision_number", default)]
    pub revision_number: i64,
    #[serde(default)]
    pub author: AccountInfo,
}

/// one open change as reported by the review service
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeInfo {
    pub id: String,
    pub subject: String,
    pub branch: String,
    #[serde(default)]
    pub current_revision: String,
    #[serde(default)]
    pub revisions: BTreeMap<String, RevisionInfo>,
    #[serde(default)]
    pub labels: BTreeMap<String, LabelInfo>,
    #[serde(default)]
    pub messages: Vec<MessageInfo>,
}

impl ChangeInfo {
    pub fn current(&self) -> Option<&RevisionInfo> {
        self.revisions.get(&self.current_revision)
    }

    fn label(&self, name: &str) -> LabelInfo {
        self.labels.get(name).cloned().unwrap_or_default()
    }
}

/// recipients of a posted report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notify {
    Owner,
    OwnerReviewers,
}

impl Notify {
    fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "OWNER",
            Self::OwnerReviewers => "OWNER_REVIEWERS",
        }
    }
}

/// Thin blocking adapter for the review service REST endpoint.
#[derive(Debug)]
pub struct ReviewClient {
    agent: ureq::Agent,
    cfg: ReviewConfig,
}

impl ReviewClient {
    pub fn new(cfg: ReviewConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .build();

        Self { agent, cfg }
    }

    fn auth(&self) -> String {
        let credentials = format!("{}:{}", self.cfg.username, self.cfg.password);

        format!("Basic {}", BASE64.encode(credentials))
    }

    /// open changes on the project from the last three days, with enough
    /// detail to judge eligibility
    pub fn query_open_changes(&self) -> Result<Vec<ChangeInfo>, ReviewError> {
        info!("querying review service for changes...");

        let body = self
            .agent
            .get(&format!("{}/a/changes/", self.cfg.url))
            .set("Authorization", &self.auth())
            .query("q", &format!("project:{} status:open -age:3d", self.cfg.project))
            .query("n", "100")
            .query("o", "CURRENT_REVISION")
            .query("o", "CURRENT_COMMIT")
            .query("o", "MESSAGES")
            .query("o", "LABELS")
            .query("o", "DETAILED_ACCOUNTS")
            .call()
            .map_err(Box::new)?
            .into_string()?;

        Ok(parse_body(&body)?)
    }

    /// post a report message on the given revision of a change
    pub fn post_review(
        &self,
        change_id: &str,
        revision: &str,
        message: &str,
        notify: Notify,
    ) -> Result<(), ReviewError> {
        self.agent
            .post(&format!(
                "{}/a/changes/{}/revisions/{}/review",
                self.cfg.url, change_id, revision
            ))
            .set("Authorization", &self.auth())
            .send_json(serde_json::json!({
                "message": message,
                "tag": REVIEW_TAG,
                "notify": notify.as_str(),
            }))
            .map_err(Box::new)?;

        Ok(())
    }
}

// responses are shielded with a magic prefix line against cross-site
// script inclusion, drop it before decoding
fn parse_body<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, serde_json::Error> {
    let body = body.strip_prefix(")]}'").unwrap_or(body);

    serde_json::from_str(body.trim_start())
}

fn trusted(email: &str, domain: &str) -> bool {
    !email.is_empty() && email.ends_with(&format!("@{domain}"))
}

/// Filter and rank the open changes, returning the most deserving one.
///
/// Read-only pass: ineligible changes (wrong branch, untrusted author
/// without a trusted reviewer or allow-list entry, negative review or
/// verification score, revision already reported on) are dropped, the rest
/// are scored and the first highest-scoring change wins.
pub fn select_candidate<'a>(
    changes: &'a [ChangeInfo],
    branch: &str,
    review: &ReviewConfig,
    external_accounts: &[String],
) -> Option<&'a ChangeInfo> {
    let mut best: Option<(&ChangeInfo, i32)> = None;

    for change in changes {
        let Some(current) = change.current() else {
            warn!("couldn't find current revision for change '{}'", change.id);
            continue;
        };

        if change.branch != branch {
            continue;
        }

        let code_review = change.label(LABEL_CODE_REVIEW);
        let verified = change.label(LABEL_VERIFIED);
        let presubmit = change.label(LABEL_PRESUBMIT_READY);
        let ci = change.label(LABEL_CI);

        let domain = &review.trusted_domain;
        let committer = &current.commit.committer.email;
        if !(trusted(committer, domain)
            || trusted(&code_review.approved.email, domain)
            || trusted(&code_review.recommended.email, domain)
            || trusted(&presubmit.approved.email, domain))
        {
            let permitted = external_accounts
                .iter()
                .any(|email| email.eq_ignore_ascii_case(committer));
            if !permitted {
                continue;
            }
        }

        if code_review.value < 0 || verified.value < 0 {
            continue;
        }

        // skip if this revision was already reported on
        let already_posted = change.messages.iter().any(|msg| {
            msg.revision_number == current.number && msg.author.email == review.email
        });
        if already_posted {
            continue;
        }

        let mut priority = 0;
        if !presubmit.approved.email.is_empty() {
            priority += 10;
        }
        priority += code_review.value;
        if !code_review.approved.email.is_empty() {
            priority += 2;
        }
        if !ci.approved.email.is_empty() {
            priority += 1;
        }

        // strictly greater keeps the first encountered on ties
        if best.map_or(true, |(_, top)| priority > top) {
            best = Some((change, priority));
        }
    }

    best.map(|(change, _)| change)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn review_config() -> ReviewConfig {
        ReviewConfig {
            url: "https://review.example.com".to_owned(),
            project: "project".to_owned(),
            username: "bot".to_owned(),
            email: "bot@example.com".to_owned(),
            password: "secret".to_owned(),
            trusted_domain: "example.com".to_owned(),
        }
    }

    fn change(id: &str, committer: &str) -> ChangeInfo {
        let mut revisions = BTreeMap::new();
        revisions.insert(
            "rev1".to_owned(),
            RevisionInfo {
                number: 1,
                ref_name: format!("refs/changes/00/{id}/1"),
                commit: CommitInfo {
                    committer: AccountInfo {
                        email: committer.to_owned(),
                    },
                    parents: Vec::new(),
                },
            },
        );

        ChangeInfo {
            id: id.to_owned(),
            subject: format!("change {id}"),
            branch: "main".to_owned(),
            current_revision: "rev1".to_owned(),
            revisions,
            labels: BTreeMap::new(),
            messages: Vec::new(),
        }
    }

    fn approve(change: &mut ChangeInfo, label: &str, email: &str) {
        change.labels.insert(
            label.to_owned(),
            LabelInfo {
                value: 0,
                approved: AccountInfo {
                    email: email.to_owned(),
                },
                recommended: AccountInfo::default(),
            },
        );
    }

    fn score(change: &mut ChangeInfo, label: &str, value: i32) {
        change
            .labels
            .entry(label.to_owned())
            .or_insert_with(LabelInfo::default)
            .value = value;
    }

    #[test]
    fn highest_priority_eligible_change_wins() {
        let mut low = change("low", "dev@example.com");
        score(&mut low, LABEL_CODE_REVIEW, 1);
        let mut high = change("high", "dev@example.com");
        approve(&mut high, LABEL_PRESUBMIT_READY, "approver@example.com");

        let changes = vec![low, high];
        let picked = select_candidate(&changes, "main", &review_config(), &[]).unwrap();

        assert_eq!(picked.id, "high");
    }

    #[test]
    fn ties_keep_the_first_encountered() {
        let changes = vec![
            change("first", "dev@example.com"),
            change("second", "dev@example.com"),
        ];

        let picked = select_candidate(&changes, "main", &review_config(), &[]).unwrap();
        assert_eq!(picked.id, "first");
    }

    #[test]
    fn negative_review_score_excludes_even_release_ready_changes() {
        let mut rejected = change("rejected", "dev@example.com");
        approve(&mut rejected, LABEL_PRESUBMIT_READY, "approver@example.com");
        approve(&mut rejected, LABEL_CI, "ci@example.com");
        score(&mut rejected, LABEL_CODE_REVIEW, -1);

        let changes = vec![rejected];
        assert!(select_candidate(&changes, "main", &review_config(), &[]).is_none());
    }

    #[test]
    fn negative_verification_score_excludes() {
        let mut broken = change("broken", "dev@example.com");
        score(&mut broken, LABEL_VERIFIED, -1);

        let changes = vec![broken];
        assert!(select_candidate(&changes, "main", &review_config(), &[]).is_none());
    }

    #[test]
    fn untrusted_committer_needs_a_trusted_reviewer_or_allow_list() {
        let outsider = change("outsider", "dev@elsewhere.org");

        let changes = vec![outsider.clone()];
        assert!(select_candidate(&changes, "main", &review_config(), &[]).is_none());

        // an approving reviewer from the trusted domain admits the change
        let mut reviewed = outsider.clone();
        approve(&mut reviewed, LABEL_CODE_REVIEW, "reviewer@example.com");
        let changes = vec![reviewed];
        assert!(select_candidate(&changes, "main", &review_config(), &[]).is_some());

        // so does an allow-list entry, case-insensitively
        let changes = vec![outsider];
        let allowed = ["Dev@Elsewhere.ORG".to_owned()];
        assert!(select_candidate(&changes, "main", &review_config(), &allowed).is_some());
    }

    #[test]
    fn already_reported_revisions_are_skipped() {
        let mut reported = change("reported", "dev@example.com");
        reported.messages.push(MessageInfo {
            revision_number: 1,
            author: AccountInfo {
                email: "bot@example.com".to_owned(),
            },
        });

        let changes = vec![reported];
        assert!(select_candidate(&changes, "main", &review_config(), &[]).is_none());
    }

    #[test]
    fn reports_on_older_revisions_do_not_block() {
        let mut reported = change("reported", "dev@example.com");
        reported.messages.push(MessageInfo {
            revision_number: 0,
            author: AccountInfo {
                email: "bot@example.com".to_owned(),
            },
        });

        let changes = vec![reported];
        assert!(select_candidate(&changes, "main", &review_config(), &[]).is_some());
    }

    #[test]
    fn other_branches_are_ignored() {
        let mut branched = change("branched", "dev@example.com");
        branched.branch = "release-1.0".to_owned();

        let changes = vec![branched];
        assert!(select_candidate(&changes, "main", &review_config(), &[]).is_none());
    }

    #[test]
    fn xssi_guard_prefix_is_stripped() {
        let changes: Vec<ChangeInfo> = parse_body(
            ")]}'\n[{\"id\": \"x\", \"subject\": \"s\", \"branch\": \"main\"}]",
        )
        .unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].id, "x");
    }
}
