mod data;
mod engine;
mod error;
mod kernel;
mod portfolio;
mod results;
mod scenario;

pub use data::{
    load_data, load_exchange, load_inflation, load_portfolio_series, DataPoint, DataSeries,
};
pub use engine::{
    find_max_withdrawal_rate, simulate, simulations_ran, sweep_withdrawal_rates,
    withdrawal_rate_grid,
};
pub use error::SimulationError;
pub use portfolio::{normalize_portfolio, parse_portfolio, total_allocation, AssetAllocation};
pub use results::Results;
pub use scenario::{
    CashMethod, Flexibility, Rebalancing, Scenario, WithdrawalMethod, WithdrawalSelection,
    DEFAULT_FEES, DEFAULT_INITIAL_VALUE, DEFAULT_MINIMUM, VANGUARD_MAX_DECREASE,
    VANGUARD_MAX_INCREASE,
};
