use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    Direct,
    Group,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::Direct => "direct",
            ConversationType::Group => "group",
        }
    }

    pub fn parse(s: &str) -> AppResult<Self> {
        match s {
            "direct" => Ok(ConversationType::Direct),
            "group" => Ok(ConversationType::Group),
            other => Err(AppError::InvalidArgument(format!(
                "unknown conversation type {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> AppResult<Self> {
        match s {
            "member" => Ok(Role::Member),
            "admin" => Ok(Role::Admin),
            other => Err(AppError::InvalidArgument(format!("unknown role {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: Uuid,
    pub role: Role,
    pub last_read_sequence: i64,
}

/// Conversation aggregate.
///
/// Invariants:
/// 1. Direct: exactly two participants, never mutated after creation.
/// 2. Group: at least one admin; the last admin cannot be removed.
/// 3. Only admins add or remove participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub conversation_type: ConversationType,
    pub display_name: String,
    pub avatar_url: String,
    pub created_at: DateTime<Utc>,
    pub participants: HashMap<Uuid, Participant>,
}

impl Conversation {
    pub fn can_send(&self, user_id: Uuid) -> AppResult<()> {
        if !self.participants.contains_key(&user_id) {
            return Err(AppError::PermissionDenied(format!(
                "user {user_id} is not a participant"
            )));
        }
        Ok(())
    }

    pub fn is_admin(&self, user_id: Uuid) -> bool {
        self.participants
            .get(&user_id)
            .map(|p| p.role == Role::Admin)
            .unwrap_or(false)
    }

    pub fn admin_count(&self) -> usize {
        self.participants
            .values()
            .filter(|p| p.role == Role::Admin)
            .count()
    }

    pub fn participant_ids(&self) -> Vec<Uuid> {
        self.participants.keys().copied().collect()
    }
}

/// Canonical lookup key for a direct conversation: the sorted participant
/// pair, so either ordering resolves to the same row.
pub fn direct_lookup_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("direct:{lo}:{hi}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation_with(roles: &[(Uuid, Role)]) -> Conversation {
        Conversation {
            id: Uuid::new_v4(),
            conversation_type: ConversationType::Group,
            display_name: String::new(),
            avatar_url: String::new(),
            created_at: Utc::now(),
            participants: roles
                .iter()
                .map(|(user_id, role)| {
                    (
                        *user_id,
                        Participant {
                            user_id: *user_id,
                            role: *role,
                            last_read_sequence: 0,
                        },
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn lookup_key_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(direct_lookup_key(a, b), direct_lookup_key(b, a));
    }

    #[test]
    fn lookup_key_is_stable_for_same_pair() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let key = direct_lookup_key(a, b);
        assert!(key.starts_with("direct:"));
        assert_eq!(key, direct_lookup_key(a, b));
    }

    #[test]
    fn non_participant_cannot_send() {
        let member = Uuid::new_v4();
        let conv = conversation_with(&[(member, Role::Member)]);
        assert!(conv.can_send(member).is_ok());
        assert!(matches!(
            conv.can_send(Uuid::new_v4()),
            Err(AppError::PermissionDenied(_))
        ));
    }

    #[test]
    fn admin_count_counts_only_admins() {
        let admin = Uuid::new_v4();
        let member = Uuid::new_v4();
        let conv = conversation_with(&[(admin, Role::Admin), (member, Role::Member)]);
        assert_eq!(conv.admin_count(), 1);
        assert!(conv.is_admin(admin));
        assert!(!conv.is_admin(member));
    }

    #[test]
    fn type_and_role_round_trip_through_strings() {
        assert_eq!(
            ConversationType::parse("direct").unwrap(),
            ConversationType::Direct
        );
        assert_eq!(ConversationType::Group.as_str(), "group");
        assert_eq!(Role::parse("admin").unwrap(), Role::Admin);
        assert!(Role::parse("owner").is_err());
    }
}
