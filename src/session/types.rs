use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::ArtifactRef;

/// One conversion result waiting to be collected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Tool category whose registry owns the session
    pub category: String,
    pub input: Option<ArtifactRef>,
    pub output: Option<ArtifactRef>,
    /// Terminal error of a deferred conversion
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Fixed at creation, never extended
    pub expires_at: DateTime<Utc>,
    /// Passed through to clients untouched
    pub metadata: Map<String, Value>,
}

impl Session {
    /// A session is expired from `expires_at` onward.
    ///
    /// The sweeper and the download gateway both use this predicate so they
    /// never disagree about a session.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_ready(&self) -> bool {
        self.output.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Whether the session reached a terminal state (output or failure)
    pub fn is_settled(&self) -> bool {
        self.is_ready() || self.is_failed()
    }

    /// Every artifact the session owns
    pub fn artifacts(&self) -> Vec<ArtifactRef> {
        self.input
            .iter()
            .chain(self.output.iter())
            .cloned()
            .collect()
    }

    /// Whole seconds until expiry, clamped at zero
    pub fn expires_in_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ArtifactKind;
    use chrono::Duration;

    fn artifact(kind: ArtifactKind, name: &str) -> ArtifactRef {
        ArtifactRef {
            key: format!("{}/{}", kind.dir_name(), name),
            kind,
            file_name: name.to_string(),
            content_type: "text/plain".to_string(),
            size: 1,
        }
    }

    fn session(now: DateTime<Utc>) -> Session {
        Session {
            id: "abc".to_string(),
            category: "file-tools".to_string(),
            input: Some(artifact(ArtifactKind::Input, "in.txt")),
            output: None,
            failure: None,
            created_at: now,
            expires_at: now + Duration::minutes(4),
            metadata: Map::new(),
        }
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let session = session(now);

        assert!(!session.is_expired_at(session.expires_at - Duration::milliseconds(1)));
        assert!(session.is_expired_at(session.expires_at));
        assert!(session.is_expired_at(session.expires_at + Duration::milliseconds(1)));
    }

    #[test]
    fn test_artifacts_lists_present_refs() {
        let now = Utc::now();
        let mut session = session(now);
        assert_eq!(session.artifacts().len(), 1);
        assert!(!session.is_ready());

        session.output = Some(artifact(ArtifactKind::Output, "out.txt"));
        assert_eq!(session.artifacts().len(), 2);
        assert!(session.is_ready());
        assert!(session.is_settled());
    }

    #[test]
    fn test_expires_in_seconds_clamps() {
        let now = Utc::now();
        let session = session(now);
        assert_eq!(session.expires_in_seconds(now), 240);
        assert_eq!(session.expires_in_seconds(now + Duration::hours(1)), 0);
    }
}
