//! Caller identity at the HTTP boundary.
//!
//! Authentication itself happens upstream; the gateway forwards the verified
//! identity in the `x-actor-role` and `x-actor-id` headers.

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::assignment::{AssignmentRecord, Canceller, CancellerRole};

pub const ROLE_HEADER: &str = "x-actor-role";
pub const ID_HEADER: &str = "x-actor-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Customer,
    Courier,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "customer" => Ok(Role::Customer),
            "courier" => Ok(Role::Courier),
            other => Err(format!("unknown actor role {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn require_admin(&self) -> Result<(), AppError> {
        match self.role {
            Role::Admin => Ok(()),
            _ => Err(AppError::Forbidden("admin role required".to_string())),
        }
    }

    /// The calling courier's identifier. Courier responses are always made
    /// under this identity, never one taken from the request body.
    pub fn courier_id(&self) -> Result<Uuid, AppError> {
        if self.role != Role::Courier {
            return Err(AppError::Forbidden("courier role required".to_string()));
        }
        self.id
            .parse()
            .map_err(|_| AppError::Unauthorized(format!("courier id {:?} is not a uuid", self.id)))
    }

    pub fn canceller(&self) -> Result<Canceller, AppError> {
        let role = match self.role {
            Role::Admin => CancellerRole::Admin,
            Role::Customer => CancellerRole::Customer,
            Role::Courier => {
                return Err(AppError::Forbidden(
                    "only customers and admins may cancel".to_string(),
                ));
            }
        };
        Ok(Canceller {
            role,
            id: self.id.clone(),
        })
    }

    pub fn may_view(&self, record: &AssignmentRecord) -> bool {
        match self.role {
            Role::Admin => true,
            Role::Customer => record.customer_id() == self.id,
            Role::Courier => self.id.parse::<Uuid>().is_ok_and(|courier_id| {
                record
                    .offers()
                    .iter()
                    .any(|offer| offer.courier_id == courier_id)
            }),
        }
    }

    /// Heartbeats for a courier come from that courier or from an admin.
    pub fn require_courier_or_admin(&self, courier_id: Uuid) -> Result<(), AppError> {
        if self.role == Role::Admin || self.courier_id()? == courier_id {
            return Ok(());
        }
        Err(AppError::Forbidden(format!(
            "not allowed to update courier {courier_id}"
        )))
    }

    pub fn may_view_courier(&self, courier_id: Uuid) -> bool {
        match self.role {
            Role::Admin => true,
            Role::Courier => self.id.parse::<Uuid>().is_ok_and(|id| id == courier_id),
            Role::Customer => false,
        }
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Result<&'a str, AppError> {
    parts
        .headers
        .get(name)
        .ok_or_else(|| AppError::Unauthorized(format!("missing {name} header")))?
        .to_str()
        .map_err(|_| AppError::Unauthorized(format!("invalid {name} header encoding")))
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let role = header(parts, ROLE_HEADER)?
            .parse::<Role>()
            .map_err(AppError::Unauthorized)?;
        let id = header(parts, ID_HEADER)?.trim();
        if id.is_empty() {
            return Err(AppError::Unauthorized(format!("empty {ID_HEADER} header")));
        }

        Ok(Actor {
            id: id.to_string(),
            role,
        })
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{Actor, Role};
    use crate::models::assignment::CancellerRole;

    fn actor(role: Role, id: &str) -> Actor {
        Actor {
            id: id.to_string(),
            role,
        }
    }

    #[test]
    fn roles_parse_case_insensitively() {
        assert_eq!("Admin".parse::<Role>(), Ok(Role::Admin));
        assert_eq!(" courier ".parse::<Role>(), Ok(Role::Courier));
        assert!("driver".parse::<Role>().is_err());
    }

    #[test]
    fn couriers_cannot_cancel() {
        let courier = actor(Role::Courier, &Uuid::new_v4().to_string());
        assert!(courier.canceller().is_err());

        let customer = actor(Role::Customer, "customer-1");
        assert_eq!(customer.canceller().unwrap().role, CancellerRole::Customer);
    }

    #[test]
    fn courier_identity_must_be_a_uuid() {
        assert!(actor(Role::Courier, "bob").courier_id().is_err());
        assert!(actor(Role::Admin, &Uuid::new_v4().to_string()).courier_id().is_err());

        let id = Uuid::new_v4();
        assert_eq!(actor(Role::Courier, &id.to_string()).courier_id().unwrap(), id);
    }

    #[test]
    fn couriers_only_see_their_own_history() {
        let id = Uuid::new_v4();
        let courier = actor(Role::Courier, &id.to_string());
        assert!(courier.may_view_courier(id));
        assert!(!courier.may_view_courier(Uuid::new_v4()));
        assert!(actor(Role::Admin, "ops").may_view_courier(id));
    }

    #[test]
    fn heartbeats_only_from_self_or_admin() {
        let id = Uuid::new_v4();
        assert!(actor(Role::Courier, &id.to_string()).require_courier_or_admin(id).is_ok());
        assert!(actor(Role::Admin, "ops").require_courier_or_admin(id).is_ok());
        assert!(
            actor(Role::Courier, &Uuid::new_v4().to_string())
                .require_courier_or_admin(id)
                .is_err()
        );
        assert!(actor(Role::Customer, "customer-1").require_courier_or_admin(id).is_err());
    }
}
