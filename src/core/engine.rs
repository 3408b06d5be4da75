//! Engine facade: validates a scenario, clamps the requested period to the
//! available data, dispatches to an arity-specialized kernel, and exposes
//! the batch helpers the studies are built from.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use rayon::prelude::*;

use super::data::DataSeries;
use super::error::SimulationError;
use super::kernel;
use super::results::Results;
use super::scenario::Scenario;

static SIMULATIONS: AtomicUsize = AtomicUsize::new(0);

/// Windows simulated by this process, across every scenario.
pub fn simulations_ran() -> usize {
    SIMULATIONS.load(Ordering::Relaxed)
}

/// Run one scenario over every historical window. Validation failures come
/// back as an errored `Results`, never as a panic.
pub fn simulate(scenario: &Scenario) -> Results {
    let started = Instant::now();

    if let Err(error) = scenario.validate() {
        return Results::from_error(error);
    }

    let (start_year, end_year, years, message) = match validate_period(scenario) {
        Ok(period) => period,
        Err(error) => return Results::from_error(error),
    };

    if !message.is_empty() {
        log::info!("{message}");
    }

    let results = match scenario.portfolio.len() {
        1 => kernel::run::<1>(scenario, start_year, end_year, years, message, started),
        2 => kernel::run::<2>(scenario, start_year, end_year, years, message, started),
        3 => kernel::run::<3>(scenario, start_year, end_year, years, message, started),
        4 => kernel::run::<4>(scenario, start_year, end_year, years, message, started),
        5 => kernel::run::<5>(scenario, start_year, end_year, years, message, started),
        n => {
            return Results::from_error(SimulationError::Configuration(format!(
                "portfolios of {n} assets are not supported (5 at most)"
            )))
        }
    };

    SIMULATIONS.fetch_add(results.terminal_values.len(), Ordering::Relaxed);
    results
}

/// Clamp the requested `[start_year, end_year]` to the intersection of all
/// required series. Returns the tightened period plus any informational
/// message about the adjustment.
fn validate_period(
    scenario: &Scenario,
) -> Result<(u16, u16, usize, String), SimulationError> {
    let mut start_year = scenario.start_year;
    let mut end_year = scenario.end_year;
    let mut years = scenario.years;

    if start_year >= end_year {
        return Err(SimulationError::InvalidPeriod(
            "the end year must be after the start year".to_string(),
        ));
    }
    if years == 0 {
        return Err(SimulationError::InvalidPeriod(
            "the duration must be at least one year".to_string(),
        ));
    }

    let mut required: Vec<&DataSeries> = Vec::with_capacity(scenario.values.len() + 2);
    required.push(scenario.inflation.as_ref());
    for series in &scenario.values {
        required.push(series.as_ref());
    }
    for series in scenario.exchange_rates.iter().flatten() {
        required.push(series.as_ref());
    }

    if scenario.strict_validation {
        for series in &required {
            if end_year < series.start_year() || start_year > series.end_year() {
                return Err(SimulationError::OutOfRange);
            }
        }
    }

    let mut changed = false;
    for series in &required {
        if series.start_year() > start_year {
            start_year = series.start_year();
            changed = true;
        }
        if series.end_year() < end_year {
            end_year = series.end_year();
            changed = true;
        }
    }

    if changed && start_year >= end_year {
        return Err(SimulationError::InvalidPeriod(
            "no overlap between the period and the historical data".to_string(),
        ));
    }

    let mut message = String::new();
    if changed {
        message = format!(
            "The period has been changed to {start_year}:{end_year} based on the available data."
        );
    }

    if ((end_year - start_year) as usize) < years {
        years = (end_year - start_year) as usize;
        if !message.is_empty() {
            message.push(' ');
        }
        message.push_str(&format!(
            "The period is too short for the requested duration. The number of years has been reduced to {years}."
        ));
    }

    Ok((start_year, end_year, years, message))
}

/// Simulate the same scenario over a withdrawal-rate grid, in parallel.
/// Each worker gets its own scenario clone; the series stay shared.
pub fn sweep_withdrawal_rates(scenario: &Scenario, rates: &[f32]) -> Vec<(f32, Results)> {
    rates
        .par_iter()
        .map(|&wr| {
            let mut candidate = scenario.clone();
            candidate.wr = wr;
            (wr, simulate(&candidate))
        })
        .collect()
}

/// The inclusive withdrawal-rate grid `start, start+step, … end`, with the
/// half-step fudge that keeps the upper bound in the grid despite rounding.
pub fn withdrawal_rate_grid(start: f32, end: f32, step: f32) -> Vec<f32> {
    let mut rates = Vec::new();
    let mut wr = start;
    while wr < end + step / 2.0 {
        rates.push(wr);
        wr += step;
    }
    rates
}

/// Highest withdrawal rate whose success rate meets `target`, found by
/// bisection (success is monotonically non-increasing in the rate) and
/// rounded down to `precision`.
pub fn find_max_withdrawal_rate(
    scenario: &Scenario,
    target_success_rate: f32,
    precision: f32,
) -> Option<(f32, Results)> {
    let mut lo = 0.0_f32;
    let mut hi = 20.0_f32;

    let mut floor_scenario = scenario.clone();
    floor_scenario.wr = lo;
    if simulate(&floor_scenario).success_rate < target_success_rate {
        return None;
    }

    while hi - lo > precision / 2.0 {
        let mid = (lo + hi) / 2.0;
        let mut candidate = scenario.clone();
        candidate.wr = mid;
        if simulate(&candidate).success_rate >= target_success_rate {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    let wr = (lo / precision).floor() * precision;
    let mut best = scenario.clone();
    best.wr = wr;
    let results = simulate(&best);
    Some((wr, results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::constant_returns;
    use crate::core::portfolio::parse_portfolio;
    use crate::core::scenario::WithdrawalSelection;
    use std::sync::Arc;

    fn flat_scenario(portfolio: &str, years: usize, wr: f32) -> Scenario {
        let portfolio = parse_portfolio(portfolio, false).expect("must parse");
        let values: Vec<_> = portfolio
            .iter()
            .map(|p| Arc::new(constant_returns(&p.asset, 1900, 1960, 1.0)))
            .collect();
        let inflation = Arc::new(constant_returns("no_inflation", 1900, 1960, 1.0));

        let mut scenario = Scenario::new(portfolio, values, inflation, years, wr, 1900, 1960);
        scenario.fees = 0.0;
        scenario
    }

    #[test]
    fn period_inside_data_is_unchanged_with_no_message() {
        let mut scenario = flat_scenario("us_stocks:100;", 20, 3.0);
        scenario.start_year = 1910;
        scenario.end_year = 1950;

        let (start, end, years, message) = validate_period(&scenario).expect("must validate");
        assert_eq!(start, 1910);
        assert_eq!(end, 1950);
        assert_eq!(years, 20);
        assert!(message.is_empty());
    }

    #[test]
    fn period_is_clamped_to_the_data_with_a_message() {
        let mut scenario = flat_scenario("us_stocks:100;", 20, 3.0);
        scenario.start_year = 1850;
        scenario.end_year = 2020;

        let (start, end, _, message) = validate_period(&scenario).expect("must validate");
        assert_eq!(start, 1900);
        assert_eq!(end, 1960);
        assert!(message.contains("1900:1960"));
    }

    #[test]
    fn too_short_period_shortens_the_duration() {
        let mut scenario = flat_scenario("us_stocks:100;", 40, 3.0);
        scenario.start_year = 1930;
        scenario.end_year = 1950;

        let (_, _, years, message) = validate_period(&scenario).expect("must validate");
        assert_eq!(years, 20);
        assert!(message.contains("reduced to 20"));
    }

    #[test]
    fn degenerate_periods_are_rejected() {
        let mut scenario = flat_scenario("us_stocks:100;", 20, 3.0);
        scenario.start_year = 1950;
        scenario.end_year = 1950;
        assert!(matches!(
            validate_period(&scenario),
            Err(SimulationError::InvalidPeriod(_))
        ));

        let mut scenario = flat_scenario("us_stocks:100;", 20, 3.0);
        scenario.start_year = 1960;
        scenario.end_year = 1950;
        assert!(validate_period(&scenario).is_err());
    }

    #[test]
    fn strict_validation_rejects_disjoint_periods() {
        let mut scenario = flat_scenario("us_stocks:100;", 20, 3.0);
        scenario.start_year = 1980;
        scenario.end_year = 2020;
        scenario.strict_validation = true;
        assert!(matches!(
            validate_period(&scenario),
            Err(SimulationError::OutOfRange)
        ));

        scenario.strict_validation = false;
        // Without strict validation the clamp collapses the period instead.
        assert!(matches!(
            validate_period(&scenario),
            Err(SimulationError::InvalidPeriod(_))
        ));
    }

    #[test]
    fn simulate_surfaces_validation_errors_on_the_results() {
        let mut scenario = flat_scenario("us_stocks:100;", 20, 3.0);
        scenario.start_year = 1950;
        scenario.end_year = 1940;

        let results = simulate(&scenario);
        assert!(results.error);
        assert!(!results.message.is_empty());
        assert_eq!(results.successes + results.failures, 0);
    }

    #[test]
    fn simulate_counts_windows_and_rejects_large_portfolios() {
        let before = simulations_ran();
        let results = simulate(&flat_scenario("us_stocks:100;", 20, 2.0));
        assert!(!results.error);
        assert!(simulations_ran() - before >= results.terminal_values.len());

        let too_many = flat_scenario(
            "us_stocks:20;us_bonds:20;ex_us_stocks:20;gold:20;commodities:10;cash:10;",
            20,
            2.0,
        );
        let results = simulate(&too_many);
        assert!(results.error);
        assert!(results.message.contains("5 at most"));
    }

    #[test]
    fn simulate_dispatches_every_supported_arity() {
        for portfolio in [
            "us_stocks:100;",
            "us_stocks:60;us_bonds:40;",
            "us_stocks:50;us_bonds:30;gold:20;",
            "us_stocks:40;us_bonds:30;gold:20;cash:10;",
            "us_stocks:40;us_bonds:20;gold:20;cash:10;commodities:10;",
        ] {
            let results = simulate(&flat_scenario(portfolio, 10, 1.0));
            assert!(!results.error, "portfolio {portfolio}: {}", results.message);
            assert_eq!(results.success_rate, 100.0);
        }
    }

    #[test]
    fn selection_configuration_errors_surface_as_results() {
        let mut scenario = flat_scenario("gold:50;commodities:50;", 10, 1.0);
        scenario.selection = WithdrawalSelection::BondsFirst;
        let results = simulate(&scenario);
        assert!(results.error);
        assert!(results.message.contains("us_bonds"));
    }

    #[test]
    fn withdrawal_rate_grid_includes_both_bounds() {
        let grid = withdrawal_rate_grid(3.0, 5.0, 0.25);
        assert_eq!(grid.len(), 9);
        assert!((grid[0] - 3.0).abs() < 1e-6);
        assert!((grid[8] - 5.0).abs() < 1e-4);
    }

    #[test]
    fn sweep_runs_every_rate() {
        let scenario = flat_scenario("us_stocks:100;", 10, 3.0);
        let grid = withdrawal_rate_grid(1.0, 3.0, 1.0);
        let swept = sweep_withdrawal_rates(&scenario, &grid);

        assert_eq!(swept.len(), 3);
        for (wr, results) in &swept {
            assert!(!results.error, "wr {wr}: {}", results.message);
            assert_eq!(results.success_rate, 100.0);
        }
        // Higher rates leave less terminal value.
        assert!(swept[0].1.tv_average > swept[2].1.tv_average);
    }

    #[test]
    fn max_withdrawal_rate_search_finds_the_flat_market_failsafe() {
        // On a flat market with no fees, any rate up to 100/years succeeds
        // and anything above fails: 10 years -> 10% is the breakeven.
        let scenario = flat_scenario("us_stocks:100;", 10, 0.0);
        let (wr, results) =
            find_max_withdrawal_rate(&scenario, 100.0, 0.01).expect("must find a rate");

        assert!(!results.error);
        assert_eq!(results.success_rate, 100.0);
        assert!((9.8..=10.05).contains(&wr), "found {wr}");
    }
}
