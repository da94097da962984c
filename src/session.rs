use serde::{Deserialize, Serialize};

/// One of the two fixed seats in a call. Only the initiator creates the offer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn remote(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

/// Identifies one call: the caller-supplied id (for example an appointment id)
/// and the seat this process takes in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub role: Role,
}

impl Session {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    /// Relay topic for this session.
    pub fn topic(&self, prefix: &str) -> String {
        format!("{}:{}", prefix, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_role_is_the_other_seat() {
        assert_eq!(Role::Initiator.remote(), Role::Responder);
        assert_eq!(Role::Responder.remote(), Role::Initiator);
    }

    #[test]
    fn topic_joins_prefix_and_id() {
        let s = Session::new("appt-42", Role::Initiator);
        assert_eq!(s.topic("call"), "call:appt-42");
    }
}
