//! Plan catalog.

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::{
    error::{Result, ShopError},
    purchase::Provider,
};

/// One subscription plan.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    /// Length in 30-day months.
    pub months: u32,
    /// Fiat price, also charged for balance purchases.
    pub price: Decimal,
    /// Price in stars; the plan is not sold for stars when absent.
    #[serde(default)]
    pub stars_price: Option<Decimal>,
}

/// Plans on sale.
///
/// ```toml
/// [[plans]]
/// months = 1
/// price = 199
/// stars_price = 100
///
/// [[plans]]
/// months = 3
/// price = 549
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
}

impl PlanCatalog {
    /// Builds a catalog from plans.
    #[must_use]
    pub fn new(plans: Vec<Plan>) -> Self {
        Self { plans }
    }

    /// Price of a `months` plan paid through `provider`.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::InvalidInput`] when no such plan is offered.
    pub fn price(&self, months: u32, provider: Provider) -> Result<Decimal> {
        self.plans
            .iter()
            .find(|p| p.months == months)
            .and_then(|p| match provider {
                Provider::Stars => p.stars_price,
                Provider::Crypto | Provider::Card | Provider::Balance => Some(p.price),
            })
            .ok_or_else(|| {
                ShopError::InvalidInput(format!("no {months}-month plan for {provider}"))
            })
    }

    /// Months on sale, ascending.
    #[must_use]
    pub fn offered_months(&self) -> Vec<u32> {
        let mut months: Vec<_> = self.plans.iter().map(|p| p.months).collect();
        months.sort_unstable();
        months.dedup();
        months
    }

    /// Checks months and prices.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::Config`] describing the first bad entry: a
    /// 0-month plan, a duplicate, or a non-positive price.
    pub fn validate(&self) -> Result<()> {
        for (index, plan) in self.plans.iter().enumerate() {
            if plan.months == 0 {
                return Err(ShopError::Config("plans cannot be 0 months".to_owned()));
            }
            if self.plans[..index].iter().any(|p| p.months == plan.months) {
                return Err(ShopError::Config(format!("duplicate {}-month plan", plan.months)));
            }
            let stars_ok = plan.stars_price.is_none_or(|s| s > Decimal::ZERO);
            if plan.price <= Decimal::ZERO || !stars_ok {
                return Err(ShopError::Config(format!(
                    "{}-month plan must have positive prices",
                    plan.months
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        plans: PlanCatalog,
    }

    fn catalog() -> PlanCatalog {
        let wrapper: Wrapper = toml::from_str(
            r"
            [[plans]]
            months = 3
            price = 549

            [[plans]]
            months = 1
            price = 199
            stars_price = 100
            ",
        )
        .unwrap();
        wrapper.plans
    }

    #[test]
    fn test_price_by_provider() {
        let plans = catalog();
        assert_eq!(plans.price(3, Provider::Card).unwrap(), Decimal::new(549, 0));
        assert_eq!(plans.price(3, Provider::Balance).unwrap(), Decimal::new(549, 0));
        assert_eq!(plans.price(1, Provider::Stars).unwrap(), Decimal::new(100, 0));
        assert!(plans.price(3, Provider::Stars).is_err());
        assert!(plans.price(12, Provider::Crypto).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(catalog().validate().is_ok());

        let duplicate = PlanCatalog::new(vec![
            Plan { months: 1, price: Decimal::ONE, stars_price: None },
            Plan { months: 1, price: Decimal::TWO, stars_price: None },
        ]);
        assert!(duplicate.validate().is_err());

        let free = PlanCatalog::new(vec![Plan {
            months: 1,
            price: Decimal::ZERO,
            stars_price: None,
        }]);
        assert!(free.validate().is_err());
    }

    #[test]
    fn test_offered_months_sorted() {
        assert_eq!(catalog().offered_months(), vec![1, 3]);
    }
}
