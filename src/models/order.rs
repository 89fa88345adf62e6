use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::models::courier::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct OrderSummary {
    pub total_amount: f64,
    pub item_count: u32,
}

/// Order-placement input for `DispatchEngine::create_and_assign`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAssignment {
    pub order_id: String,
    pub customer_id: String,
    pub restaurant_id: String,
    pub restaurant_location: GeoPoint,
    pub customer_location: GeoPoint,
    pub order_summary: OrderSummary,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub assignment_radius_km: Option<f64>,
}

impl NewAssignment {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_id("order_id", &self.order_id)?;
        require_id("customer_id", &self.customer_id)?;
        require_id("restaurant_id", &self.restaurant_id)?;

        if !self.restaurant_location.is_valid() {
            return Err(ValidationError::InvalidLocation {
                field: "restaurant_location",
            });
        }
        if !self.customer_location.is_valid() {
            return Err(ValidationError::InvalidLocation {
                field: "customer_location",
            });
        }

        let total = self.order_summary.total_amount;
        if !(total.is_finite() && total > 0.0) {
            return Err(ValidationError::NotPositive {
                field: "order_summary.total_amount",
            });
        }
        if self.order_summary.item_count == 0 {
            return Err(ValidationError::NotPositive {
                field: "order_summary.item_count",
            });
        }

        if let Some(radius) = self.assignment_radius_km {
            if !(radius.is_finite() && radius > 0.0) {
                return Err(ValidationError::NotPositive {
                    field: "assignment_radius_km",
                });
            }
        }

        Ok(())
    }
}

fn require_id(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{NewAssignment, OrderSummary};
    use crate::error::ValidationError;
    use crate::models::courier::GeoPoint;

    fn input() -> NewAssignment {
        NewAssignment {
            order_id: "order-1".to_string(),
            customer_id: "customer-1".to_string(),
            restaurant_id: "restaurant-1".to_string(),
            restaurant_location: GeoPoint::new(52.52, 13.405),
            customer_location: GeoPoint::new(52.53, 13.41),
            order_summary: OrderSummary {
                total_amount: 24.5,
                item_count: 2,
            },
            priority: None,
            assignment_radius_km: None,
        }
    }

    #[test]
    fn well_formed_input_passes() {
        assert_eq!(input().validate(), Ok(()));
    }

    #[test]
    fn blank_identifier_is_missing() {
        let mut bad = input();
        bad.restaurant_id = "   ".to_string();
        assert_eq!(
            bad.validate(),
            Err(ValidationError::MissingField {
                field: "restaurant_id"
            })
        );
    }

    #[test]
    fn out_of_range_location_is_rejected() {
        let mut bad = input();
        bad.customer_location = GeoPoint::new(12.0, 200.0);
        assert_eq!(
            bad.validate(),
            Err(ValidationError::InvalidLocation {
                field: "customer_location"
            })
        );
    }

    #[test]
    fn non_positive_amounts_and_radius_are_rejected() {
        let mut bad = input();
        bad.order_summary.total_amount = 0.0;
        assert!(bad.validate().is_err());

        let mut bad = input();
        bad.order_summary.item_count = 0;
        assert!(bad.validate().is_err());

        let mut bad = input();
        bad.assignment_radius_km = Some(-1.0);
        assert_eq!(
            bad.validate(),
            Err(ValidationError::NotPositive {
                field: "assignment_radius_km"
            })
        );
    }
}
