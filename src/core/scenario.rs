use std::sync::Arc;

use super::data::{load_inflation, load_portfolio_series, DataSeries};
use super::error::SimulationError;
use super::portfolio::{normalize_portfolio, parse_portfolio, AssetAllocation};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Rebalancing {
    None,
    Monthly,
    Yearly,
    Threshold,
}

impl Rebalancing {
    pub fn parse(input: &str) -> Result<Self, SimulationError> {
        match input {
            "none" => Ok(Rebalancing::None),
            "monthly" => Ok(Rebalancing::Monthly),
            "yearly" => Ok(Rebalancing::Yearly),
            "threshold" => Ok(Rebalancing::Threshold),
            other => Err(SimulationError::Configuration(format!(
                "invalid rebalancing policy \"{other}\""
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rebalancing::None => "none",
            Rebalancing::Monthly => "monthly",
            Rebalancing::Yearly => "yearly",
            Rebalancing::Threshold => "threshold",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WithdrawalMethod {
    /// Fixed amount in real terms: the initial rate, inflated every month.
    Standard,
    /// Percentage of the current portfolio, floored by the minimum.
    Current,
    /// Percentage of current with a yearly ceiling and floor relative to the
    /// previous year's amount.
    Vanguard,
}

impl WithdrawalMethod {
    pub fn parse(input: &str) -> Result<Self, SimulationError> {
        match input {
            "standard" => Ok(WithdrawalMethod::Standard),
            "current" => Ok(WithdrawalMethod::Current),
            "vanguard" => Ok(WithdrawalMethod::Vanguard),
            other => Err(SimulationError::Configuration(format!(
                "invalid withdrawal method \"{other}\""
            ))),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WithdrawalSelection {
    /// Debit each asset proportionally to its share of the portfolio.
    Allocation,
    /// Debit bonds first, overflowing to the other asset.
    BondsFirst,
    /// Debit stocks first, overflowing to the other asset.
    StocksFirst,
}

impl WithdrawalSelection {
    pub fn parse(input: &str) -> Result<Self, SimulationError> {
        match input {
            "allocation" => Ok(WithdrawalSelection::Allocation),
            "bonds" => Ok(WithdrawalSelection::BondsFirst),
            "stocks" => Ok(WithdrawalSelection::StocksFirst),
            other => Err(SimulationError::Configuration(format!(
                "invalid withdrawal selection \"{other}\""
            ))),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CashMethod {
    /// Draw from the cash buffer on every withdrawal.
    Simple,
    /// Draw from the cash buffer only when the effective monthly withdrawal
    /// rate is at least the nominal monthly rate.
    Smart,
}

impl CashMethod {
    pub fn parse(input: &str) -> Result<Self, SimulationError> {
        match input {
            "simple" => Ok(CashMethod::Simple),
            "smart" => Ok(CashMethod::Smart),
            other => Err(SimulationError::Configuration(format!(
                "invalid cash method \"{other}\""
            ))),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Flexibility {
    None,
    /// Reduce withdrawals when the portfolio falls below a fraction of its
    /// initial value.
    Portfolio,
    /// Reduce withdrawals when the market falls below a fraction of its
    /// historical high inside the window.
    Market,
}

// Rebalancing penalties, in percent of the portfolio.
pub const MONTHLY_REBALANCING_COST: f32 = 0.005;
pub const YEARLY_REBALANCING_COST: f32 = 0.01;
pub const THRESHOLD_REBALANCING_COST: f32 = 0.01;

pub const DEFAULT_INITIAL_VALUE: f32 = 1000.0;
pub const DEFAULT_FEES: f32 = 0.001;
pub const DEFAULT_MINIMUM: f32 = 0.03;
pub const VANGUARD_MAX_INCREASE: f32 = 0.05;
pub const VANGUARD_MAX_DECREASE: f32 = 0.02;

/// Everything one simulation run needs. Immutable once handed to the
/// engine; per-window scratch lives in the kernel.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub portfolio: Vec<AssetAllocation>,
    /// Per-asset monthly returns, aligned with `portfolio`.
    pub values: Vec<Arc<DataSeries>>,
    /// Monthly inflation returns.
    pub inflation: Arc<DataSeries>,
    /// Per-asset exchange-rate returns; `None` where no conversion applies.
    pub exchange_rates: Vec<Option<Arc<DataSeries>>>,

    pub years: usize,
    pub start_year: u16,
    pub end_year: u16,

    /// Yearly withdrawal rate in percent of the initial value.
    pub wr: f32,
    pub withdraw_frequency: usize,
    pub withdraw_method: WithdrawalMethod,
    /// Withdrawal floor as a fraction of the initial value, for the
    /// percentage-of-current methods.
    pub minimum: f32,
    pub selection: WithdrawalSelection,

    pub rebalance: Rebalancing,
    pub rebalance_threshold: f32,
    /// Yearly expense ratio as a fraction (0.001 = 0.1%).
    pub fees: f32,

    pub initial_value: f32,
    /// The portfolio must retain this fraction of the (possibly inflated)
    /// initial value at the horizon.
    pub final_threshold: f32,
    pub final_inflation: bool,

    pub initial_cash: f32,
    pub cash_method: CashMethod,

    pub glidepath: bool,
    pub gp_pass: f32,
    pub gp_goal: f32,

    pub social_security: bool,
    pub social_delay: usize,
    pub social_coverage: f32,

    pub flexibility: Flexibility,
    pub flexibility_threshold_1: f32,
    pub flexibility_change_1: f32,
    pub flexibility_threshold_2: f32,
    pub flexibility_change_2: f32,

    pub timeout_msecs: u64,
    pub strict_validation: bool,
}

impl Scenario {
    pub fn new(
        portfolio: Vec<AssetAllocation>,
        values: Vec<Arc<DataSeries>>,
        inflation: Arc<DataSeries>,
        years: usize,
        wr: f32,
        start_year: u16,
        end_year: u16,
    ) -> Self {
        let exchange_rates = vec![None; portfolio.len()];

        Self {
            portfolio,
            values,
            inflation,
            exchange_rates,
            years,
            start_year,
            end_year,
            wr,
            withdraw_frequency: 1,
            withdraw_method: WithdrawalMethod::Standard,
            minimum: DEFAULT_MINIMUM,
            selection: WithdrawalSelection::Allocation,
            rebalance: Rebalancing::None,
            rebalance_threshold: 0.0,
            fees: DEFAULT_FEES,
            initial_value: DEFAULT_INITIAL_VALUE,
            final_threshold: 0.0,
            final_inflation: false,
            initial_cash: 0.0,
            cash_method: CashMethod::Smart,
            glidepath: false,
            gp_pass: 0.0,
            gp_goal: 0.0,
            social_security: false,
            social_delay: 0,
            social_coverage: 0.0,
            flexibility: Flexibility::None,
            flexibility_threshold_1: 1.0,
            flexibility_change_1: 1.0,
            flexibility_threshold_2: 1.0,
            flexibility_change_2: 1.0,
            timeout_msecs: 0,
            strict_validation: false,
        }
    }

    /// Parse a portfolio string, load every series it needs, and assemble a
    /// scenario with the defaults.
    pub fn load(
        portfolio_str: &str,
        inflation_name: &str,
        years: usize,
        wr: f32,
        start_year: u16,
        end_year: u16,
    ) -> Result<Self, SimulationError> {
        let mut portfolio = parse_portfolio(portfolio_str, false)?;
        normalize_portfolio(&mut portfolio);

        let values = load_portfolio_series(&portfolio)?;
        let inflation = load_inflation(&values, inflation_name)?;

        Ok(Scenario::new(
            portfolio, values, inflation, years, wr, start_year, end_year,
        ))
    }

    pub fn total_months(&self) -> usize {
        self.years * 12
    }

    /// Index of the asset the withdrawal selection debits first.
    pub fn withdraw_index(&self) -> Result<usize, SimulationError> {
        let wanted = match self.selection {
            WithdrawalSelection::Allocation => return Ok(0),
            WithdrawalSelection::BondsFirst => "us_bonds",
            WithdrawalSelection::StocksFirst => "us_stocks",
        };

        self.portfolio
            .iter()
            .position(|position| position.asset == wanted)
            .ok_or_else(|| {
                SimulationError::Configuration(format!(
                    "withdrawal selection requires a {wanted} position"
                ))
            })
    }

    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.portfolio.is_empty() {
            return Err(SimulationError::Configuration(
                "the portfolio cannot be empty".to_string(),
            ));
        }

        if self.values.len() != self.portfolio.len()
            || self.exchange_rates.len() != self.portfolio.len()
        {
            return Err(SimulationError::Configuration(
                "portfolio, return series and exchange series must align".to_string(),
            ));
        }

        if self.years == 0 {
            return Err(SimulationError::InvalidPeriod(
                "the duration must be at least one year".to_string(),
            ));
        }

        if self.withdraw_frequency == 0 || self.withdraw_frequency > self.total_months() {
            return Err(SimulationError::Configuration(
                "the withdrawal frequency must be between 1 and the number of months".to_string(),
            ));
        }

        if self.withdraw_method == WithdrawalMethod::Vanguard && self.withdraw_frequency != 1 {
            return Err(SimulationError::Configuration(
                "the Vanguard method is only implemented with monthly withdrawals".to_string(),
            ));
        }

        if self.social_security {
            if self.withdraw_method != WithdrawalMethod::Standard {
                return Err(SimulationError::Configuration(
                    "social security is only implemented with the standard withdrawal method"
                        .to_string(),
                ));
            }
            if self.initial_cash > 0.0 {
                return Err(SimulationError::Configuration(
                    "social security cannot be combined with a cash buffer".to_string(),
                ));
            }
        }

        if self.selection != WithdrawalSelection::Allocation {
            if self.portfolio.len() > 2 {
                return Err(SimulationError::Configuration(
                    "stocks/bonds withdrawal selection requires a stocks/bonds portfolio".to_string(),
                ));
            }
            self.withdraw_index()?;
        }

        if self.flexibility != Flexibility::None {
            if self.flexibility_threshold_1 <= self.flexibility_threshold_2 {
                return Err(SimulationError::Configuration(
                    "flexibility thresholds must be decreasing".to_string(),
                ));
            }
            for value in [
                self.flexibility_threshold_1,
                self.flexibility_threshold_2,
                self.flexibility_change_1,
                self.flexibility_change_2,
            ] {
                if !(0.0..=1.0).contains(&value) {
                    return Err(SimulationError::Configuration(
                        "flexibility thresholds and reductions must be between 0 and 1".to_string(),
                    ));
                }
            }
        }

        if self.glidepath {
            if self.portfolio.len() < 2 {
                return Err(SimulationError::Configuration(
                    "a glidepath requires at least two assets".to_string(),
                ));
            }
            if !self.portfolio[0].asset.ends_with("_stocks") {
                return Err(SimulationError::Configuration(
                    "a glidepath requires a stocks position as the first asset".to_string(),
                ));
            }
            if !matches!(self.rebalance, Rebalancing::None | Rebalancing::Monthly) {
                return Err(SimulationError::Configuration(
                    "a glidepath requires none or monthly rebalancing".to_string(),
                ));
            }
            let start = self.portfolio[0].allocation;
            if self.gp_pass == 0.0
                || (self.gp_pass > 0.0 && self.gp_goal <= start)
                || (self.gp_pass < 0.0 && self.gp_goal >= start)
            {
                return Err(SimulationError::Configuration(
                    "the glidepath pass must move the allocation toward its goal".to_string(),
                ));
            }
        }

        if self.wr < 0.0 {
            return Err(SimulationError::Configuration(
                "the withdrawal rate cannot be negative".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::constant_returns;
    use crate::core::portfolio::parse_portfolio;

    pub(crate) fn flat_scenario(portfolio: &str, years: usize, wr: f32) -> Scenario {
        let portfolio = parse_portfolio(portfolio, false).expect("must parse");
        let values: Vec<_> = portfolio
            .iter()
            .map(|p| Arc::new(constant_returns(&p.asset, 1900, 1990, 1.0)))
            .collect();
        let inflation = Arc::new(constant_returns("no_inflation", 1900, 1990, 1.0));

        Scenario::new(portfolio, values, inflation, years, wr, 1900, 1990)
    }

    #[test]
    fn default_scenario_is_valid() {
        let scenario = flat_scenario("us_stocks:60;us_bonds:40;", 30, 4.0);
        assert!(scenario.validate().is_ok());
    }

    #[test]
    fn vanguard_requires_monthly_frequency() {
        let mut scenario = flat_scenario("us_stocks:100;", 30, 4.0);
        scenario.withdraw_method = WithdrawalMethod::Vanguard;
        scenario.withdraw_frequency = 12;
        assert!(matches!(
            scenario.validate(),
            Err(SimulationError::Configuration(_))
        ));

        scenario.withdraw_frequency = 1;
        assert!(scenario.validate().is_ok());
    }

    #[test]
    fn social_security_rejects_cash_and_non_standard() {
        let mut scenario = flat_scenario("us_stocks:100;", 30, 4.0);
        scenario.social_security = true;
        scenario.social_delay = 10;
        scenario.social_coverage = 0.5;
        assert!(scenario.validate().is_ok());

        scenario.initial_cash = 50.0;
        assert!(scenario.validate().is_err());

        scenario.initial_cash = 0.0;
        scenario.withdraw_method = WithdrawalMethod::Current;
        assert!(scenario.validate().is_err());
    }

    #[test]
    fn selection_requires_stocks_and_bonds() {
        let mut scenario = flat_scenario("us_stocks:60;us_bonds:40;", 30, 4.0);
        scenario.selection = WithdrawalSelection::BondsFirst;
        assert!(scenario.validate().is_ok());
        assert_eq!(scenario.withdraw_index().expect("must resolve"), 1);

        scenario.selection = WithdrawalSelection::StocksFirst;
        assert_eq!(scenario.withdraw_index().expect("must resolve"), 0);

        let mut scenario = flat_scenario("gold:50;commodities:50;", 30, 4.0);
        scenario.selection = WithdrawalSelection::BondsFirst;
        assert!(scenario.validate().is_err());

        let mut scenario = flat_scenario("us_stocks:40;us_bonds:40;gold:20;", 30, 4.0);
        scenario.selection = WithdrawalSelection::StocksFirst;
        assert!(scenario.validate().is_err());
    }

    #[test]
    fn flexibility_thresholds_must_decrease() {
        let mut scenario = flat_scenario("us_stocks:100;", 30, 4.0);
        scenario.flexibility = Flexibility::Portfolio;
        scenario.flexibility_threshold_1 = 0.8;
        scenario.flexibility_change_1 = 0.9;
        scenario.flexibility_threshold_2 = 0.9;
        scenario.flexibility_change_2 = 0.8;
        assert!(scenario.validate().is_err());

        scenario.flexibility_threshold_2 = 0.6;
        assert!(scenario.validate().is_ok());
    }

    #[test]
    fn glidepath_validation() {
        let mut scenario = flat_scenario("us_stocks:40;us_bonds:60;", 30, 4.0);
        scenario.glidepath = true;
        scenario.gp_pass = 0.5;
        scenario.gp_goal = 80.0;
        assert!(scenario.validate().is_ok());

        scenario.rebalance = Rebalancing::Yearly;
        assert!(scenario.validate().is_err());

        scenario.rebalance = Rebalancing::Monthly;
        scenario.gp_goal = 20.0;
        assert!(scenario.validate().is_err());

        scenario.gp_pass = -0.5;
        assert!(scenario.validate().is_ok());

        let mut scenario = flat_scenario("us_bonds:60;us_stocks:40;", 30, 4.0);
        scenario.glidepath = true;
        scenario.gp_pass = 0.5;
        scenario.gp_goal = 80.0;
        assert!(scenario.validate().is_err());
    }

    #[test]
    fn parse_policies() {
        assert_eq!(Rebalancing::parse("monthly").expect("ok"), Rebalancing::Monthly);
        assert_eq!(Rebalancing::parse("none").expect("ok"), Rebalancing::None);
        assert!(Rebalancing::parse("sometimes").is_err());

        assert_eq!(
            WithdrawalMethod::parse("vanguard").expect("ok"),
            WithdrawalMethod::Vanguard
        );
        assert!(WithdrawalMethod::parse("spend_it_all").is_err());

        assert_eq!(
            WithdrawalSelection::parse("bonds").expect("ok"),
            WithdrawalSelection::BondsFirst
        );
        assert_eq!(CashMethod::parse("simple").expect("ok"), CashMethod::Simple);
    }
}
