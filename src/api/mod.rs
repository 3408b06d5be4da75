//! HTTP surface. Every endpoint answers HTTP 200 with a
//! `{"results": {...}}` envelope; clients read the `error` flag.

use axum::{
    extract::Query,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::core::{
    load_exchange, simulate, total_allocation, CashMethod, Flexibility, Rebalancing, Results,
    Scenario, SimulationError, WithdrawalMethod,
};

/// Interactive requests are cut off well before they can monopolize a
/// worker.
const REQUEST_TIMEOUT_MSECS: u64 = 200;

/// Nominal yearly growth assumed during the accumulation phase.
const ACCUMULATION_GROWTH: f32 = 0.05;
const ACCUMULATION_MONTHS_CAP: usize = 1000;

pub async fn run_http_server(listen: &str, port: u16) -> std::io::Result<()> {
    let addr: SocketAddr = format!("{listen}:{port}")
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let app = Router::new()
        .route("/api/simple", get(simple_handler))
        .route("/api/retirement", get(retirement_handler))
        .route("/api/fi_planner", get(fi_planner_handler));

    let listener = TcpListener::bind(addr).await?;
    log::info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    log::info!("shutting down");
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SimplePayload {
    inflation: Option<String>,
    years: Option<usize>,
    wr: Option<f32>,
    start: Option<u16>,
    end: Option<u16>,

    portfolio: Option<String>,
    p_us_stocks: Option<f32>,
    p_us_bonds: Option<f32>,
    p_ex_us_stocks: Option<f32>,
    p_ch_stocks: Option<f32>,
    p_ch_bonds: Option<f32>,
    p_gold: Option<f32>,
    p_commodities: Option<f32>,
    p_cash: Option<f32>,

    rebalance: Option<String>,
    rebalance_threshold: Option<f32>,
    initial: Option<f32>,
    fees: Option<f32>,
    final_threshold: Option<f32>,
    final_inflation: Option<bool>,

    social_security: Option<bool>,
    social_delay: Option<usize>,
    social_coverage: Option<f32>,
    social_amount: Option<f32>,
    extra_income_amount: Option<f32>,

    withdraw_frequency: Option<usize>,
    withdraw_minimum: Option<f32>,
    withdraw_method: Option<String>,

    initial_cash: Option<f32>,
    cash_method: Option<String>,

    gp: Option<bool>,
    gp_pass: Option<f32>,
    gp_goal: Option<f32>,

    flexibility: Option<String>,
    flexibility_threshold_1: Option<f32>,
    flexibility_change_1: Option<f32>,
    flexibility_threshold_2: Option<f32>,
    flexibility_change_2: Option<f32>,

    currency: Option<String>,
    inflation2: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResultsEnvelope {
    results: Results,
}

fn results_response(results: Results) -> Response {
    Json(ResultsEnvelope { results }).into_response()
}

fn error_response(error: SimulationError) -> Response {
    results_response(Results::from_error(error))
}

fn require<T>(value: Option<T>, name: &str) -> Result<T, SimulationError> {
    value.ok_or_else(|| SimulationError::Configuration(format!("missing parameter {name}")))
}

/// Build the portfolio string either from `portfolio` directly or from the
/// per-asset fraction parameters.
fn portfolio_string(payload: &SimplePayload) -> Result<String, SimulationError> {
    if let Some(portfolio) = &payload.portfolio {
        return Ok(portfolio.clone());
    }

    let fractions = [
        ("us_stocks", payload.p_us_stocks),
        ("us_bonds", payload.p_us_bonds),
        ("ex_us_stocks", payload.p_ex_us_stocks),
        ("ch_stocks", payload.p_ch_stocks),
        ("ch_bonds", payload.p_ch_bonds),
        ("gold", payload.p_gold),
        ("commodities", payload.p_commodities),
        ("cash", payload.p_cash),
    ];

    let mut portfolio = String::new();
    for (asset, fraction) in fractions {
        let fraction = fraction.unwrap_or(0.0);
        if fraction > 0.0 {
            portfolio.push_str(&format!("{asset}:{fraction};"));
        }
    }

    if portfolio.is_empty() {
        return Err(SimulationError::Configuration(
            "missing parameter portfolio (or the p_<asset> fractions)".to_string(),
        ));
    }

    Ok(portfolio)
}

/// Attach exchange-rate series for a foreign-currency investor. CHF
/// investors convert every non-Swiss asset through `usd_chf`; USD investors
/// convert Swiss assets through the inverted pair.
fn attach_exchange_rates(
    scenario: &mut Scenario,
    currency: &str,
) -> Result<(), SimulationError> {
    match currency {
        "" | "usd" => {
            let mut rates = None;
            for (i, position) in scenario.portfolio.iter().enumerate() {
                if position.asset.starts_with("ch_") {
                    if rates.is_none() {
                        rates = Some(load_exchange("usd_chf", true)?);
                    }
                    scenario.exchange_rates[i] = rates.clone();
                }
            }
            Ok(())
        }
        "chf" => {
            let mut rates = None;
            for (i, position) in scenario.portfolio.iter().enumerate() {
                if !position.asset.starts_with("ch_") && position.asset != "cash" {
                    if rates.is_none() {
                        rates = Some(load_exchange("usd_chf", false)?);
                    }
                    scenario.exchange_rates[i] = rates.clone();
                }
            }
            Ok(())
        }
        other => Err(SimulationError::Configuration(format!(
            "unsupported currency \"{other}\""
        ))),
    }
}

fn scenario_from_payload(payload: &SimplePayload) -> Result<Scenario, SimulationError> {
    let portfolio = portfolio_string(payload)?;
    let inflation = require(payload.inflation.clone(), "inflation")?;
    let years = require(payload.years, "years")?;
    let wr = require(payload.wr, "wr")?;
    let start = require(payload.start, "start")?;
    let end = require(payload.end, "end")?;

    let inflation_name = match (&payload.currency, &payload.inflation2) {
        (Some(currency), Some(inflation2)) if currency != "usd" => inflation2.clone(),
        _ => inflation,
    };

    let mut scenario = Scenario::load(&portfolio, &inflation_name, years, wr, start, end)?;
    scenario.timeout_msecs = REQUEST_TIMEOUT_MSECS;

    if let Some(rebalance) = &payload.rebalance {
        scenario.rebalance = Rebalancing::parse(rebalance)?;
    }
    if let Some(threshold) = payload.rebalance_threshold {
        scenario.rebalance_threshold = threshold;
    }
    if let Some(initial) = payload.initial {
        scenario.initial_value = initial;
    }
    if let Some(fees) = payload.fees {
        scenario.fees = fees / 100.0;
    }
    if let Some(final_threshold) = payload.final_threshold {
        scenario.final_threshold = final_threshold;
    }
    if let Some(final_inflation) = payload.final_inflation {
        scenario.final_inflation = final_inflation;
    }

    if let Some(frequency) = payload.withdraw_frequency {
        scenario.withdraw_frequency = frequency;
    }
    if let Some(minimum) = payload.withdraw_minimum {
        scenario.minimum = minimum;
    }
    if let Some(method) = &payload.withdraw_method {
        scenario.withdraw_method = WithdrawalMethod::parse(method)?;
    }

    if let Some(cash) = payload.initial_cash {
        scenario.initial_cash = cash;
    }
    if let Some(method) = &payload.cash_method {
        scenario.cash_method = CashMethod::parse(method)?;
    }

    if payload.gp.unwrap_or(false) {
        scenario.glidepath = true;
        scenario.gp_pass = require(payload.gp_pass, "gp_pass")?;
        scenario.gp_goal = require(payload.gp_goal, "gp_goal")?;
    }

    if payload.social_security.unwrap_or(false) {
        scenario.social_security = true;
        scenario.social_delay = require(payload.social_delay, "social_delay")?;

        // The coverage can be given directly, or derived from a yearly
        // amount relative to the planned withdrawal.
        let yearly_withdrawal = scenario.initial_value * wr / 100.0;
        let mut coverage = payload.social_coverage.unwrap_or_else(|| {
            payload.social_amount.unwrap_or(0.0) / yearly_withdrawal
        });
        coverage += payload.extra_income_amount.unwrap_or(0.0) / yearly_withdrawal;
        scenario.social_coverage = coverage.clamp(0.0, 1.0);
    }

    if let Some(flexibility) = &payload.flexibility {
        scenario.flexibility = match flexibility.as_str() {
            "none" => Flexibility::None,
            "portfolio" => Flexibility::Portfolio,
            "market" => Flexibility::Market,
            other => {
                return Err(SimulationError::Configuration(format!(
                    "invalid flexibility \"{other}\""
                )))
            }
        };
        if let Some(value) = payload.flexibility_threshold_1 {
            scenario.flexibility_threshold_1 = value;
        }
        if let Some(value) = payload.flexibility_change_1 {
            scenario.flexibility_change_1 = value;
        }
        if let Some(value) = payload.flexibility_threshold_2 {
            scenario.flexibility_threshold_2 = value;
        }
        if let Some(value) = payload.flexibility_change_2 {
            scenario.flexibility_change_2 = value;
        }
    }

    if let Some(currency) = &payload.currency {
        attach_exchange_rates(&mut scenario, currency)?;
    }

    Ok(scenario)
}

async fn simple_handler(Query(payload): Query<SimplePayload>) -> Response {
    log::debug!("simple request: {payload:?}");

    match scenario_from_payload(&payload) {
        Ok(scenario) => results_response(simulate(&scenario)),
        Err(error) => error_response(error),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RetirementPayload {
    expenses: Option<f32>,
    income: Option<f32>,
    wr: Option<f32>,
    sr: Option<f32>,
    nw: Option<f32>,
    rebalance: Option<String>,
}

#[derive(Debug, Serialize)]
struct PortfolioSuccessRates {
    portfolio: &'static str,
    success_rate_30: f32,
    success_rate_40: f32,
    success_rate_50: f32,
}

#[derive(Debug, Serialize)]
struct RetirementResults {
    fi_number: f32,
    months_to_fi: usize,
    years_to_fi: f32,
    portfolios: Vec<PortfolioSuccessRates>,
    message: String,
    error: bool,
}

#[derive(Debug, Serialize)]
struct RetirementEnvelope {
    results: RetirementResults,
}

/// Months of compounding plus savings until the FI number is reached.
fn months_to_fi(net_worth: f32, fi_number: f32, monthly_savings: f32) -> usize {
    let monthly_growth = (1.0 + ACCUMULATION_GROWTH).powf(1.0 / 12.0);

    let mut months = 0;
    let mut current = net_worth;
    while current < fi_number && months < ACCUMULATION_MONTHS_CAP {
        current = current * monthly_growth + monthly_savings;
        months += 1;
    }

    months
}

const PRESET_PORTFOLIOS: [&str; 3] = [
    "us_stocks:100;",
    "us_stocks:60;us_bonds:40;",
    "us_stocks:40;us_bonds:60;",
];

fn retirement_results(payload: &RetirementPayload) -> Result<RetirementResults, SimulationError> {
    let expenses = require(payload.expenses, "expenses")?;
    let income = require(payload.income, "income")?;
    let wr = require(payload.wr, "wr")?;
    let sr = require(payload.sr, "sr")?;
    let nw = require(payload.nw, "nw")?;

    if wr <= 0.0 {
        return Err(SimulationError::Configuration(
            "wr must be positive".to_string(),
        ));
    }

    let rebalance = match &payload.rebalance {
        Some(rebalance) => Rebalancing::parse(rebalance)?,
        None => Rebalancing::None,
    };

    let fi_number = expenses * 100.0 / wr;
    let monthly_savings = income * sr / 100.0 / 12.0;
    let months = months_to_fi(nw, fi_number, monthly_savings);

    let mut portfolios = Vec::with_capacity(PRESET_PORTFOLIOS.len());
    for portfolio in PRESET_PORTFOLIOS {
        let mut rates = [0.0_f32; 3];
        for (slot, years) in [30_usize, 40, 50].into_iter().enumerate() {
            let mut scenario =
                Scenario::load(portfolio, "us_inflation", years, wr, 1871, 2100)?;
            scenario.rebalance = rebalance;
            scenario.timeout_msecs = REQUEST_TIMEOUT_MSECS;

            let results = simulate(&scenario);
            if results.error {
                return Err(SimulationError::Configuration(results.message));
            }
            rates[slot] = results.success_rate;
        }

        portfolios.push(PortfolioSuccessRates {
            portfolio,
            success_rate_30: rates[0],
            success_rate_40: rates[1],
            success_rate_50: rates[2],
        });
    }

    Ok(RetirementResults {
        fi_number,
        months_to_fi: months,
        years_to_fi: months as f32 / 12.0,
        portfolios,
        message: String::new(),
        error: false,
    })
}

async fn retirement_handler(Query(payload): Query<RetirementPayload>) -> Response {
    log::debug!("retirement request: {payload:?}");

    match retirement_results(&payload) {
        Ok(results) => Json(RetirementEnvelope { results }).into_response(),
        Err(error) => error_response(error),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FiPlannerPayload {
    expenses: Option<f32>,
    income: Option<f32>,
    wr: Option<f32>,
    sr: Option<f32>,
    nw: Option<f32>,
    portfolio: Option<String>,
    inflation: Option<String>,
    years: Option<usize>,
    start: Option<u16>,
    end: Option<u16>,
    rebalance: Option<String>,
}

#[derive(Debug, Serialize)]
struct FiPlannerResults {
    fi_number: f32,
    months_to_fi: usize,
    years_to_fi: f32,
    simulation: Results,
    projection_years: usize,
    net_worth_low: Vec<f32>,
    net_worth_median: Vec<f32>,
    net_worth_high: Vec<f32>,
    message: String,
    error: bool,
}

#[derive(Debug, Serialize)]
struct FiPlannerEnvelope {
    results: FiPlannerResults,
}

/// Yearly portfolio returns over the whole history, with static weights.
fn historical_yearly_returns(scenario: &Scenario) -> Vec<f32> {
    let series = &scenario.values[0];
    let total = total_allocation(&scenario.portfolio).max(1e-6);

    let mut yearly = Vec::new();
    let mut index = 0;
    while index + 12 <= series.points.len() {
        let mut compounded = 1.0_f32;
        for month in 0..12 {
            let mut blended = 0.0;
            for (i, position) in scenario.portfolio.iter().enumerate() {
                // Series may differ in support; fall back to a neutral month
                // where an asset has no data for this calendar month.
                let point = series.points[index + month];
                let value = scenario.values[i]
                    .index_of(point.year, point.month)
                    .map(|at| scenario.values[i].value_at(at))
                    .unwrap_or(1.0);
                blended += position.allocation / total * value;
            }
            compounded *= blended;
        }
        yearly.push(compounded - 1.0);
        index += 12;
    }

    yearly
}

fn percentile(sorted: &[f32], fraction: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (fraction * (sorted.len() - 1) as f32).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn project_net_worth(
    net_worth: f32,
    yearly_savings: f32,
    yearly_return: f32,
    years: usize,
) -> Vec<f32> {
    let mut projection = Vec::with_capacity(years);
    let mut current = net_worth;
    for _ in 0..years {
        current = current * (1.0 + yearly_return) + yearly_savings;
        projection.push(current);
    }
    projection
}

fn fi_planner_results(payload: &FiPlannerPayload) -> Result<FiPlannerResults, SimulationError> {
    let expenses = require(payload.expenses, "expenses")?;
    let income = require(payload.income, "income")?;
    let wr = require(payload.wr, "wr")?;
    let sr = require(payload.sr, "sr")?;
    let nw = require(payload.nw, "nw")?;

    if wr <= 0.0 {
        return Err(SimulationError::Configuration(
            "wr must be positive".to_string(),
        ));
    }

    let portfolio = payload
        .portfolio
        .clone()
        .unwrap_or_else(|| "us_stocks:60;us_bonds:40;".to_string());
    let inflation = payload
        .inflation
        .clone()
        .unwrap_or_else(|| "us_inflation".to_string());
    let years = payload.years.unwrap_or(30);
    let start = payload.start.unwrap_or(1871);
    let end = payload.end.unwrap_or(2100);

    let mut scenario = Scenario::load(&portfolio, &inflation, years, wr, start, end)?;
    if let Some(rebalance) = &payload.rebalance {
        scenario.rebalance = Rebalancing::parse(rebalance)?;
    }
    scenario.timeout_msecs = REQUEST_TIMEOUT_MSECS;

    let fi_number = expenses * 100.0 / wr;
    let yearly_savings = income * sr / 100.0;
    let months = months_to_fi(nw, fi_number, yearly_savings / 12.0);

    let simulation = simulate(&scenario);
    if simulation.error {
        return Err(SimulationError::Configuration(simulation.message));
    }

    let mut yearly_returns = historical_yearly_returns(&scenario);
    yearly_returns.sort_by(|a, b| a.total_cmp(b));

    let projection_years = (months / 12 + years).min(80);
    let low = percentile(&yearly_returns, 0.25);
    let median = percentile(&yearly_returns, 0.50);
    let high = percentile(&yearly_returns, 0.75);

    Ok(FiPlannerResults {
        fi_number,
        months_to_fi: months,
        years_to_fi: months as f32 / 12.0,
        simulation,
        projection_years,
        net_worth_low: project_net_worth(nw, yearly_savings, low, projection_years),
        net_worth_median: project_net_worth(nw, yearly_savings, median, projection_years),
        net_worth_high: project_net_worth(nw, yearly_savings, high, projection_years),
        message: String::new(),
        error: false,
    })
}

async fn fi_planner_handler(Query(payload): Query<FiPlannerPayload>) -> Response {
    log::debug!("fi_planner request: {payload:?}");

    match fi_planner_results(&payload) {
        Ok(results) => Json(FiPlannerEnvelope { results }).into_response(),
        Err(error) => error_response(error),
    }
}
