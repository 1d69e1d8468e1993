//! Authorization decision contract.
//!
//! The broker under test delegates connect and topic-access decisions to a
//! stateless HTTP service: a connect check posts [`ConnectAuthRequest`], an
//! ACL check posts [`AclCheckRequest`], and an HTTP 200 means allow. The
//! load engine never calls that service. Its rejected connects and refused
//! subscriptions are explained by it, and the in-memory broker consults an
//! [`Authorizer`] speaking the same contract so those failures can be
//! reproduced in tests.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Body of a connect authorization request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectAuthRequest {
    pub username: String,
    pub password: String,
    pub client_id: String,
}

/// Kind of topic access being checked, with broker ACL bit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum AccessLevel {
    Read = 1,
    Write = 2,
    Subscribe = 4,
}

impl From<AccessLevel> for u8 {
    fn from(level: AccessLevel) -> Self {
        level as u8
    }
}

impl TryFrom<u8> for AccessLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Read),
            2 => Ok(Self::Write),
            4 => Ok(Self::Subscribe),
            other => Err(format!("unknown access level {other}")),
        }
    }
}

/// Body of a topic ACL check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclCheckRequest {
    pub username: String,
    pub client_id: String,
    pub topic: String,
    pub access: AccessLevel,
}

/// The service's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allow(self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Answers connect and ACL checks.
pub trait Authorizer: Send + Sync {
    fn authorize_connect(&self, request: &ConnectAuthRequest) -> Decision;
    fn authorize_topic(&self, request: &AclCheckRequest) -> Decision;
}

/// Allows everything, like the stub decision service shipped with the broker setup.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize_connect(&self, _request: &ConnectAuthRequest) -> Decision {
        Decision::Allow
    }

    fn authorize_topic(&self, _request: &AclCheckRequest) -> Decision {
        Decision::Allow
    }
}

/// Deny lists for usernames and topics; everything else is allowed.
#[derive(Debug, Clone, Default)]
pub struct DenyList {
    users: HashSet<String>,
    topics: HashSet<(String, AccessLevel)>,
}

impl DenyList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connects for `username`.
    pub fn deny_user(mut self, username: impl Into<String>) -> Self {
        self.users.insert(username.into());
        self
    }

    /// Refuse `access` on `topic` for everyone.
    pub fn deny_topic(mut self, topic: impl Into<String>, access: AccessLevel) -> Self {
        self.topics.insert((topic.into(), access));
        self
    }
}

impl Authorizer for DenyList {
    fn authorize_connect(&self, request: &ConnectAuthRequest) -> Decision {
        if self.users.contains(&request.username) {
            Decision::Deny
        } else {
            Decision::Allow
        }
    }

    fn authorize_topic(&self, request: &AclCheckRequest) -> Decision {
        if self
            .topics
            .contains(&(request.topic.clone(), request.access))
        {
            Decision::Deny
        } else {
            Decision::Allow
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acl_request_wire_format() {
        let request = AclCheckRequest {
            username: "user1".to_string(),
            client_id: "user1-abc-1".to_string(),
            topic: "load/topic3".to_string(),
            access: AccessLevel::Subscribe,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["access"], 4);
        assert_eq!(json["topic"], "load/topic3");

        let back: AclCheckRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_unknown_access_level_rejected() {
        let json = r#"{"username":"u","client_id":"c","topic":"t","access":3}"#;
        assert!(serde_json::from_str::<AclCheckRequest>(json).is_err());
    }

    #[test]
    fn test_deny_list() {
        let auth = DenyList::new()
            .deny_user("user2")
            .deny_topic("secret", AccessLevel::Subscribe);

        let connect = |username: &str| ConnectAuthRequest {
            username: username.to_string(),
            password: "pw".to_string(),
            client_id: "id".to_string(),
        };
        assert_eq!(auth.authorize_connect(&connect("user2")), Decision::Deny);
        assert_eq!(auth.authorize_connect(&connect("user1")), Decision::Allow);

        let acl = |access| AclCheckRequest {
            username: "user1".to_string(),
            client_id: "id".to_string(),
            topic: "secret".to_string(),
            access,
        };
        assert_eq!(auth.authorize_topic(&acl(AccessLevel::Subscribe)), Decision::Deny);
        assert_eq!(auth.authorize_topic(&acl(AccessLevel::Write)), Decision::Allow);
    }
}
