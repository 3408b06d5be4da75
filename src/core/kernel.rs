//! The per-window time-stepping state machine. One `Window` simulates a
//! single retirement start month to completion or first failure; `run`
//! enumerates every start in the validated period and aggregates outcomes.
//!
//! The asset count is a compile-time parameter so the hot loop works on
//! fixed-size stack arrays and never allocates per month.

use std::time::Instant;

use super::error::SimulationError;
use super::results::{Accumulator, Results};
use super::scenario::{
    CashMethod, Flexibility, Rebalancing, Scenario, WithdrawalMethod, WithdrawalSelection,
    MONTHLY_REBALANCING_COST, THRESHOLD_REBALANCING_COST, VANGUARD_MAX_DECREASE,
    VANGUARD_MAX_INCREASE, YEARLY_REBALANCING_COST,
};

/// Per-window scratch state. Lives on the stack for the duration of one
/// window and is rebuilt from the scenario for the next.
#[derive(Debug, Clone, Copy)]
struct Context {
    /// 1-based month index within the window.
    months: usize,
    total_months: usize,
    /// Yearly withdrawal amount in nominal terms; inflates every month.
    withdrawal: f32,
    /// Withdrawal floor in nominal terms; inflates every month.
    minimum: f32,
    /// Capital-preservation target; inflates when `final_inflation` is set.
    target_value: f32,
    cash: f32,
    year_start_value: f32,
    year_withdrawn: f32,
    last_withdrawal: f32,
    vanguard_prev_year: f32,
    vanguard_this_year: f32,
    historical_high: f32,
    flexible: bool,
}

struct Window<'a, const N: usize> {
    scenario: &'a Scenario,
    withdraw_index: usize,
    start_year: u16,
    start_month: u16,

    current_values: [f32; N],
    /// Untouched parallel track following the market without withdrawals,
    /// observed by MARKET flexibility.
    market_values: [f32; N],
    working_allocation: [f32; N],

    return_cursors: [usize; N],
    exchange_cursors: [usize; N],
    inflation_cursor: usize,

    ctx: Context,
    failed_at: Option<usize>,
    year_spending: f32,
    spending: Vec<f32>,
}

impl<'a, const N: usize> Window<'a, N> {
    fn new(
        scenario: &'a Scenario,
        withdraw_index: usize,
        total_months: usize,
        start_year: u16,
        start_month: u16,
    ) -> Self {
        let initial = scenario.initial_value;

        let mut working_allocation = [0.0_f32; N];
        let mut current_values = [0.0_f32; N];
        let mut return_cursors = [0_usize; N];
        let mut exchange_cursors = [0_usize; N];

        for i in 0..N {
            working_allocation[i] = scenario.portfolio[i].allocation;
            current_values[i] = initial * working_allocation[i] / 100.0;
            return_cursors[i] = scenario.values[i]
                .index_of(start_year, start_month)
                .expect("window start inside the validated period");
            if let Some(exchange) = &scenario.exchange_rates[i] {
                exchange_cursors[i] = exchange
                    .index_of(start_year, start_month)
                    .expect("window start inside the validated period");
            }
        }

        let inflation_cursor = scenario
            .inflation
            .index_of(start_year, start_month)
            .expect("window start inside the validated period");

        let yearly_withdrawal = initial * scenario.wr / 100.0;

        Self {
            scenario,
            withdraw_index,
            start_year,
            start_month,
            current_values,
            market_values: current_values,
            working_allocation,
            return_cursors,
            exchange_cursors,
            inflation_cursor,
            ctx: Context {
                months: 1,
                total_months,
                withdrawal: yearly_withdrawal,
                minimum: initial * scenario.minimum,
                target_value: initial,
                cash: scenario.initial_cash,
                year_start_value: initial,
                year_withdrawn: 0.0,
                last_withdrawal: 0.0,
                vanguard_prev_year: yearly_withdrawal,
                vanguard_this_year: yearly_withdrawal,
                historical_high: initial,
                flexible: false,
            },
            failed_at: None,
            year_spending: 0.0,
            spending: Vec::with_capacity(total_months / 12 + 2),
        }
    }

    fn total(&self) -> f32 {
        self.current_values.iter().sum()
    }

    fn total_market(&self) -> f32 {
        self.market_values.iter().sum()
    }

    fn is_failure(&self, total: f32) -> bool {
        if self.ctx.months < self.ctx.total_months {
            total <= 0.0
        } else if self.scenario.final_inflation {
            total < self.scenario.final_threshold * self.ctx.target_value
        } else {
            total < self.scenario.final_threshold * self.scenario.initial_value
        }
    }

    fn fail(&mut self) {
        if self.failed_at.is_none() {
            self.failed_at = Some(self.ctx.months);
        }
    }

    fn check_failure(&mut self) -> bool {
        if self.is_failure(self.total()) {
            self.fail();
        }
        self.failed_at.is_some()
    }

    /// Pay a rebalancing penalty (in percent), failure-check, then restore
    /// every asset to its working allocation.
    fn rebalance_to_working(&mut self, cost: f32) {
        for value in &mut self.current_values {
            *value *= 1.0 - cost / 100.0;
        }

        let total = self.total();
        if self.is_failure(total) {
            self.fail();
            return;
        }

        for i in 0..N {
            self.current_values[i] = total * self.working_allocation[i] / 100.0;
        }
    }

    fn glidepath_step(&mut self) {
        if !self.scenario.glidepath || self.working_allocation[0] == self.scenario.gp_goal {
            return;
        }

        let goal = self.scenario.gp_goal;
        let mut pass = self.scenario.gp_pass;
        if pass > 0.0 && self.working_allocation[0] + pass > goal {
            pass = goal - self.working_allocation[0];
        } else if pass < 0.0 && self.working_allocation[0] + pass < goal {
            pass = goal - self.working_allocation[0];
        }

        self.working_allocation[0] += pass;
        self.working_allocation[1] -= pass;

        // Without a periodic rebalance the new targets must be applied here.
        if self.scenario.rebalance == Rebalancing::None {
            self.rebalance_to_working(MONTHLY_REBALANCING_COST);
        }
    }

    fn threshold_deviated(&self) -> bool {
        let total = self.total();
        if total <= 0.0 {
            return false;
        }

        (0..N).any(|i| {
            (self.working_allocation[i] / 100.0 - self.current_values[i] / total).abs()
                >= self.scenario.rebalance_threshold
        })
    }

    /// The STANDARD-method flexibility factor; flags the window when a
    /// reduction applies.
    fn flexibility_factor(&mut self) -> f32 {
        let ratio = match self.scenario.flexibility {
            Flexibility::None => return 1.0,
            Flexibility::Portfolio => self.total() / self.scenario.initial_value,
            Flexibility::Market => {
                let market = self.total_market();
                self.ctx.historical_high = self.ctx.historical_high.max(market);
                market / self.ctx.historical_high
            }
        };

        if ratio < self.scenario.flexibility_threshold_2 {
            self.ctx.flexible = true;
            self.scenario.flexibility_change_2
        } else if ratio < self.scenario.flexibility_threshold_1 {
            self.ctx.flexible = true;
            self.scenario.flexibility_change_1
        } else {
            1.0
        }
    }

    /// Debit `amount` from the assets following the selection policy.
    /// Returns what could actually be drawn.
    fn withdraw_from_assets(&mut self, amount: f32) -> f32 {
        match self.scenario.selection {
            WithdrawalSelection::Allocation => {
                let total = self.total();
                if total <= 0.0 {
                    return 0.0;
                }
                for value in &mut self.current_values {
                    *value = (*value - (*value / total) * amount).max(0.0);
                }
                amount.min(total)
            }
            _ => {
                let first = self.withdraw_index;
                let from_first = amount.min(self.current_values[first].max(0.0));
                self.current_values[first] -= from_first;

                let mut drawn = from_first;
                if N == 2 {
                    let second = if first == 1 { 0 } else { 1 };
                    let overflow = amount - from_first;
                    let from_second = overflow.min(self.current_values[second].max(0.0));
                    self.current_values[second] -= from_second;
                    drawn += from_second;
                }
                drawn
            }
        }
    }

    fn withdraw(&mut self) {
        let frequency = self.scenario.withdraw_frequency;
        if (self.ctx.months - 1) % frequency != 0 {
            return;
        }

        let periods = frequency.min(self.ctx.total_months - (self.ctx.months - 1)) as f32;
        let floor = self.ctx.minimum * periods / 12.0;

        let mut amount = match self.scenario.withdraw_method {
            WithdrawalMethod::Standard => {
                let amount = self.ctx.withdrawal * periods / 12.0;
                amount * self.flexibility_factor()
            }
            WithdrawalMethod::Current => {
                let amount = self.total() * self.scenario.wr / 100.0 * periods / 12.0;
                amount.max(floor)
            }
            WithdrawalMethod::Vanguard => {
                let amount = self.ctx.vanguard_this_year * periods / 12.0;
                amount.max(floor)
            }
        };

        if self.scenario.social_security
            && self.ctx.months / 12 >= self.scenario.social_delay
        {
            amount -= self.scenario.social_coverage * amount;
        }

        if amount <= 0.0 {
            return;
        }

        let mut drawn = 0.0;

        // The smart cash strategy keeps the buffer untouched while the
        // current effective monthly rate is already below the nominal one.
        let monthly_wr = amount / self.ctx.year_start_value * 100.0;
        if self.scenario.cash_method == CashMethod::Simple
            || monthly_wr >= self.scenario.wr / 12.0
        {
            let from_cash = amount.min(self.ctx.cash);
            self.ctx.cash -= from_cash;
            drawn += from_cash;
        }

        let remaining = amount - drawn;
        if remaining > 0.0 {
            drawn += self.withdraw_from_assets(remaining);
        }

        self.ctx.last_withdrawal = drawn;
        self.ctx.year_withdrawn += drawn;
        self.year_spending += drawn;

        self.check_failure();
    }

    /// One month, in the strict step order. Any failed step skips the rest
    /// of the month.
    fn step_month(&mut self) {
        for i in 0..N {
            let monthly_return = self.scenario.values[i].value_at(self.return_cursors[i]);
            self.current_values[i] *= monthly_return;
            self.market_values[i] *= monthly_return;
            self.return_cursors[i] += 1;

            if let Some(exchange) = &self.scenario.exchange_rates[i] {
                let rate = exchange.value_at(self.exchange_cursors[i]);
                self.current_values[i] *= rate;
                self.market_values[i] *= rate;
                self.exchange_cursors[i] += 1;
            }
        }

        if self.check_failure() {
            return;
        }

        self.glidepath_step();
        if self.failed_at.is_some() {
            return;
        }

        match self.scenario.rebalance {
            Rebalancing::Monthly => {
                self.rebalance_to_working(MONTHLY_REBALANCING_COST);
            }
            Rebalancing::Threshold => {
                if self.threshold_deviated() {
                    self.rebalance_to_working(THRESHOLD_REBALANCING_COST);
                }
            }
            _ => {}
        }
        if self.failed_at.is_some() {
            return;
        }

        if self.scenario.fees > 0.0 {
            for value in &mut self.current_values {
                *value *= 1.0 - self.scenario.fees / 12.0;
            }
            if self.check_failure() {
                return;
            }
        }

        let inflation = self.scenario.inflation.value_at(self.inflation_cursor);
        self.inflation_cursor += 1;
        self.ctx.withdrawal *= inflation;
        self.ctx.minimum *= inflation;
        if self.scenario.final_inflation {
            self.ctx.target_value *= inflation;
        }

        self.withdraw();
    }

    /// Calendar-year bookkeeping. Runs after every year of the window,
    /// including the partial first and last ones, and even when the year
    /// failed mid-way.
    fn end_year(&mut self, acc: &mut Accumulator, year: u16) {
        acc.add_withdrawn(self.ctx.year_withdrawn);

        if self.scenario.rebalance == Rebalancing::Yearly {
            self.rebalance_to_working(YEARLY_REBALANCING_COST);
        }

        if self.ctx.year_start_value > 0.0 {
            let eff_wr = self.ctx.year_withdrawn / self.ctx.year_start_value;
            acc.record_effective_wr(eff_wr, self.start_month, self.start_year, year);
        }

        self.spending.push(self.year_spending);
        self.year_spending = 0.0;
        self.ctx.year_withdrawn = 0.0;
        self.ctx.year_start_value = self.total();

        if self.scenario.withdraw_method == WithdrawalMethod::Vanguard {
            self.ctx.vanguard_prev_year = self.ctx.vanguard_this_year;
            let unclamped = self.total() * self.scenario.wr / 100.0;
            self.ctx.vanguard_this_year = unclamped
                .min(self.ctx.vanguard_prev_year * (1.0 + VANGUARD_MAX_INCREASE))
                .max(self.ctx.vanguard_prev_year * (1.0 - VANGUARD_MAX_DECREASE));
        }
    }

    fn run(mut self, acc: &mut Accumulator) {
        let total_months = self.ctx.total_months;
        let start_month = self.start_month as usize;
        let last_year = self.start_year + ((start_month - 1 + total_months - 1) / 12) as u16;
        let last_month = (1 + (start_month - 1 + (total_months - 1) % 12) % 12) as u16;

        for year in self.start_year..=last_year {
            let from = if year == self.start_year { self.start_month } else { 1 };
            let to = if year == last_year { last_month } else { 12 };

            for _month in from..=to {
                self.step_month();
                if self.failed_at.is_some() {
                    break;
                }
                self.ctx.months += 1;
            }

            self.end_year(acc, year);
            if self.failed_at.is_some() {
                break;
            }
        }

        acc.record_window(
            self.start_year,
            self.start_month,
            self.failed_at,
            self.total(),
            self.ctx.flexible,
            self.spending,
        );
    }
}

/// Enumerate every window of `years` in the validated period and collapse
/// the outcomes. `message` carries any informational period adjustments.
pub(crate) fn run<const N: usize>(
    scenario: &Scenario,
    start_year: u16,
    end_year: u16,
    years: usize,
    message: String,
    started: Instant,
) -> Results {
    debug_assert_eq!(scenario.portfolio.len(), N);

    let withdraw_index = scenario.withdraw_index().unwrap_or(0);
    let total_months = years * 12;
    let mut acc = Accumulator::new();

    for current_year in start_year..=end_year - years as u16 {
        for current_month in 1..=12_u16 {
            Window::<N>::new(scenario, withdraw_index, total_months, current_year, current_month)
                .run(&mut acc);

            if scenario.timeout_msecs > 0
                && started.elapsed().as_millis() as u64 > scenario.timeout_msecs
            {
                let error = SimulationError::Timeout(scenario.timeout_msecs);
                let mut results = acc.finish(years, message);
                results.message = if results.message.is_empty() {
                    error.to_string()
                } else {
                    format!("{} {error}", results.message)
                };
                results.error = true;
                return results;
            }
        }
    }

    acc.finish(years, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::{constant_returns, series_from_values, DataSeries};
    use crate::core::portfolio::parse_portfolio;
    use proptest::prelude::{prop_assert, proptest};
    use std::sync::Arc;

    fn scenario_with_returns(
        portfolio: &str,
        per_asset: &[DataSeries],
        years: usize,
        wr: f32,
    ) -> Scenario {
        let portfolio = parse_portfolio(portfolio, false).expect("must parse");
        assert_eq!(portfolio.len(), per_asset.len());

        let values: Vec<_> = per_asset.iter().cloned().map(Arc::new).collect();
        let start = per_asset[0].start_year();
        let end = per_asset[0].end_year();
        let mut inflation = per_asset[0].clone();
        inflation.name = "no_inflation".to_string();
        for point in &mut inflation.points {
            point.value = 1.0;
        }

        let mut scenario = Scenario::new(
            portfolio,
            values,
            Arc::new(inflation),
            years,
            wr,
            start,
            end,
        );
        scenario.fees = 0.0;
        scenario
    }

    fn flat_scenario(portfolio: &str, years: usize, wr: f32) -> Scenario {
        let assets = portfolio.split(';').filter(|p| !p.is_empty()).count();
        let series: Vec<_> = (0..assets)
            .map(|i| constant_returns(&format!("asset{i}"), 1900, 1960, 1.0))
            .collect();
        scenario_with_returns(portfolio, &series, years, wr)
    }

    fn single_window<const N: usize>(scenario: &Scenario) -> (Window<'_, N>, Accumulator) {
        let window = Window::<N>::new(
            scenario,
            scenario.withdraw_index().expect("selection must resolve"),
            scenario.total_months(),
            scenario.start_year,
            1,
        );
        (window, Accumulator::new())
    }

    /// Run one window starting at the scenario's first January, returning
    /// the failure month, the per-year spending vector, and the final total.
    fn run_single_window<const N: usize>(scenario: &Scenario) -> (Option<usize>, Vec<f32>, f32) {
        let mut acc = Accumulator::new();
        let (mut window, _) = single_window::<N>(scenario);
        let last_year = window.start_year + window.scenario.years as u16 - 1;

        let mut spending = Vec::new();
        for year in window.start_year..=last_year {
            for _ in 1..=12 {
                window.step_month();
                if window.failed_at.is_some() {
                    break;
                }
                window.ctx.months += 1;
            }
            spending.push(window.year_spending);
            window.end_year(&mut acc, year);
            if window.failed_at.is_some() {
                break;
            }
        }

        (window.failed_at, spending, window.total())
    }

    #[test]
    fn flat_market_four_percent_exhausts_around_month_300() {
        let mut scenario = flat_scenario("us_stocks:100;", 30, 4.0);
        scenario.end_year = 1950;
        let results = run::<1>(&scenario, 1900, 1950, 30, String::new(), Instant::now());

        assert_eq!(results.successes, 0);
        assert_eq!(results.failures, (1950 - 1900 - 30 + 1) * 12);
        assert_eq!(results.success_rate, 0.0);
        assert!(results.terminal_values.iter().all(|&tv| tv == 0.0));
        // 1000 / (40 / 12) months, within float accumulation error
        assert!(
            (299..=301).contains(&results.worst_duration),
            "worst duration was {}",
            results.worst_duration
        );
    }

    #[test]
    fn successes_and_failures_cover_every_enumerated_start() {
        let scenario = flat_scenario("us_stocks:100;", 20, 1.0);
        let results = run::<1>(&scenario, 1900, 1960, 20, String::new(), Instant::now());
        assert_eq!(
            results.successes + results.failures,
            (1960 - 1900 - 20 + 1) * 12
        );
        assert!(results.success_rate >= 0.0 && results.success_rate <= 100.0);
    }

    #[test]
    fn sustainable_rate_leaves_expected_terminal_value() {
        let scenario = flat_scenario("us_stocks:100;", 20, 2.0);
        let results = run::<1>(&scenario, 1900, 1960, 20, String::new(), Instant::now());

        assert_eq!(results.failures, 0);
        assert_eq!(results.success_rate, 100.0);
        // 1000 * (1 - 2% * 20)
        assert!((results.tv_average - 600.0).abs() < 1.0);
        assert!((results.tv_minimum - 600.0).abs() < 1.0);
        assert!((results.tv_maximum - 600.0).abs() < 1.0);
    }

    #[test]
    fn capital_preservation_with_no_withdrawal_succeeds_at_threshold_one() {
        let mut scenario = flat_scenario("us_stocks:100;", 20, 0.0);
        scenario.final_threshold = 1.0;
        scenario.final_inflation = true;

        let results = run::<1>(&scenario, 1900, 1960, 20, String::new(), Instant::now());
        assert_eq!(results.failures, 0);
        assert_eq!(results.success_rate, 100.0);
        assert!((results.tv_average - 1000.0).abs() < 1e-2);
    }

    #[test]
    fn capital_preservation_fails_when_value_ends_below_target() {
        let mut scenario = flat_scenario("us_stocks:100;", 10, 1.0);
        scenario.final_threshold = 1.0;
        scenario.final_inflation = true;

        let results = run::<1>(&scenario, 1900, 1960, 10, String::new(), Instant::now());
        assert_eq!(results.successes, 0);
        assert!(results.terminal_values.iter().all(|&tv| tv == 0.0));
    }

    #[test]
    fn monthly_rebalance_restores_working_allocation() {
        let stocks = constant_returns("us_stocks", 1900, 1930, 1.005);
        let bonds = constant_returns("us_bonds", 1900, 1930, 1.002);
        let mut scenario =
            scenario_with_returns("us_stocks:60;us_bonds:40;", &[stocks, bonds], 10, 4.0);
        scenario.rebalance = Rebalancing::Monthly;

        let (mut window, _) = single_window::<2>(&scenario);
        for _ in 0..24 {
            window.step_month();
            assert!(window.failed_at.is_none());
            let total = window.total();
            assert!((window.current_values[0] / total - 0.6).abs() < 1e-5);
            assert!((window.current_values[1] / total - 0.4).abs() < 1e-5);
            window.ctx.months += 1;
        }

        let results = run::<2>(&scenario, 1900, 1930, 10, String::new(), Instant::now());
        assert_eq!(results.success_rate, 100.0);
    }

    #[test]
    fn rebalance_is_idempotent_without_fees() {
        let scenario = flat_scenario("us_stocks:60;us_bonds:40;", 10, 4.0);
        let (mut window, _) = single_window::<2>(&scenario);

        window.current_values = [700.0, 300.0];
        window.rebalance_to_working(0.0);
        let after_first = window.current_values;
        window.rebalance_to_working(0.0);
        assert_eq!(after_first, window.current_values);
        assert!((window.current_values[0] - 600.0).abs() < 1e-3);

        // With a fee, the second pass differs exactly by one fee charge.
        window.rebalance_to_working(MONTHLY_REBALANCING_COST);
        let expected = 600.0 * (1.0 - MONTHLY_REBALANCING_COST / 100.0);
        assert!((window.current_values[0] - expected).abs() < 1e-3);
    }

    #[test]
    fn threshold_rebalance_only_fires_past_the_threshold() {
        let stocks = constant_returns("us_stocks", 1900, 1930, 1.01);
        let bonds = constant_returns("us_bonds", 1900, 1930, 1.0);
        let mut scenario =
            scenario_with_returns("us_stocks:50;us_bonds:50;", &[stocks, bonds], 10, 0.0);
        scenario.rebalance = Rebalancing::Threshold;
        scenario.rebalance_threshold = 0.20;

        let (mut window, _) = single_window::<2>(&scenario);
        for _ in 0..6 {
            window.step_month();
            window.ctx.months += 1;
        }
        // After six months of stocks drift, the share is still below the
        // 20-point threshold, so no rebalance happened.
        let total = window.total();
        assert!(window.current_values[0] / total > 0.5);
        assert!(window.current_values[0] / total < 0.7);
    }

    #[test]
    fn glidepath_moves_working_allocation_by_pass_until_goal() {
        let mut scenario = flat_scenario("us_stocks:40;us_bonds:60;", 10, 0.0);
        scenario.glidepath = true;
        scenario.gp_pass = 0.5;
        scenario.gp_goal = 80.0;

        let (mut window, _) = single_window::<2>(&scenario);
        for month in 1..=120 {
            window.step_month();
            window.ctx.months += 1;

            let expected = (40.0 + 0.5 * month as f32).min(80.0);
            assert!(
                (window.working_allocation[0] - expected).abs() < 1e-4,
                "month {month}: allocation {} != {expected}",
                window.working_allocation[0]
            );
            assert!(
                (window.working_allocation[0] + window.working_allocation[1] - 100.0).abs() < 1e-3
            );
        }
        assert_eq!(window.working_allocation[0], 80.0);
    }

    #[test]
    fn reverse_glidepath_descends_to_goal() {
        let mut scenario = flat_scenario("us_stocks:80;us_bonds:20;", 10, 0.0);
        scenario.glidepath = true;
        scenario.gp_pass = -1.0;
        scenario.gp_goal = 60.0;

        let (mut window, _) = single_window::<2>(&scenario);
        for _ in 0..40 {
            window.step_month();
            window.ctx.months += 1;
        }
        assert_eq!(window.working_allocation[0], 60.0);
    }

    #[test]
    fn social_security_halves_withdrawals_after_the_delay() {
        let mut scenario = flat_scenario("us_stocks:100;", 30, 2.0);
        scenario.social_security = true;
        scenario.social_delay = 10;
        scenario.social_coverage = 0.5;

        let (failed, spending, _) = run_single_window::<1>(&scenario);
        assert!(failed.is_none());

        let monthly = 1000.0 * 2.0 / 100.0 / 12.0;
        // Year 1 is fully unreduced. Month 120 is the last month of year 10
        // and the first reduced one.
        assert!((spending[0] - 12.0 * monthly).abs() < 1e-3);
        assert!((spending[9] - (11.0 * monthly + 0.5 * monthly)).abs() < 1e-3);
        assert!((spending[10] - 12.0 * 0.5 * monthly).abs() < 1e-3);
        assert!((spending[29] - 12.0 * 0.5 * monthly).abs() < 1e-3);
    }

    #[test]
    fn vanguard_yearly_change_is_clamped() {
        let assets = constant_returns("us_stocks", 1900, 1940, 1.01);
        let mut scenario = scenario_with_returns("us_stocks:100;", &[assets], 20, 5.0);
        scenario.withdraw_method = WithdrawalMethod::Vanguard;
        scenario.minimum = 0.0;

        let (failed, spending, _) = run_single_window::<1>(&scenario);
        assert!(failed.is_none());

        for pair in spending.windows(2) {
            let ratio = pair[1] / pair[0];
            assert!(
                ratio <= 1.0 + VANGUARD_MAX_INCREASE + 1e-4,
                "yearly raise {ratio} above the ceiling"
            );
            assert!(
                ratio >= 1.0 - VANGUARD_MAX_DECREASE - 1e-4,
                "yearly cut {ratio} below the floor"
            );
        }

        // Strongly rising market: the ceiling binds every year.
        let ratio = spending[1] / spending[0];
        assert!((ratio - (1.0 + VANGUARD_MAX_INCREASE)).abs() < 1e-3);
    }

    #[test]
    fn current_method_follows_portfolio_value() {
        let mut scenario = flat_scenario("us_stocks:100;", 10, 4.0);
        scenario.withdraw_method = WithdrawalMethod::Current;
        scenario.minimum = 0.0;

        let (failed, spending, terminal) = run_single_window::<1>(&scenario);
        assert!(failed.is_none());
        // Withdrawing a fraction of current value decays but never empties.
        assert!(terminal > 0.0);
        assert!(spending[0] > spending[9]);
    }

    #[test]
    fn current_method_respects_the_minimum_floor() {
        let mut scenario = flat_scenario("us_stocks:100;", 10, 0.1);
        scenario.withdraw_method = WithdrawalMethod::Current;
        scenario.minimum = 0.03;

        let (failed, spending, _) = run_single_window::<1>(&scenario);
        assert!(failed.is_none());
        // The floor (3% of initial) dominates the tiny current rate.
        let floor_year = 1000.0 * 0.03;
        assert!((spending[0] - floor_year).abs() < 1e-2);
    }

    #[test]
    fn portfolio_flexibility_reduces_withdrawals_in_drawdowns() {
        let mut values = vec![1.0; 12 * 31];
        // A crash in the second year pushes the portfolio under 80% of its
        // initial value.
        for value in values.iter_mut().take(24).skip(12) {
            *value = 0.97;
        }
        let series = series_from_values("us_stocks", 1900, &values);
        let mut scenario = scenario_with_returns("us_stocks:100;", &[series], 30, 3.0);
        scenario.flexibility = Flexibility::Portfolio;
        scenario.flexibility_threshold_1 = 0.9;
        scenario.flexibility_change_1 = 0.95;
        scenario.flexibility_threshold_2 = 0.8;
        scenario.flexibility_change_2 = 0.8;

        let (mut window, _) = single_window::<1>(&scenario);
        for _ in 0..36 {
            window.step_month();
            window.ctx.months += 1;
        }
        assert!(window.ctx.flexible);

        let mut rigid = scenario.clone();
        rigid.flexibility = Flexibility::None;
        let (_, flexible_spending, _) = run_single_window::<1>(&scenario);
        let (_, rigid_spending, _) = run_single_window::<1>(&rigid);
        assert!(flexible_spending[1] < rigid_spending[1]);
    }

    #[test]
    fn market_flexibility_tracks_the_high_water_mark() {
        let mut values = vec![1.0; 12 * 31];
        for value in values.iter_mut().take(24).skip(12) {
            *value = 0.97;
        }
        // Withdrawals depress the portfolio but the market track recovers;
        // only the market drawdown should matter.
        for value in values.iter_mut().take(48).skip(24) {
            *value = 1.02;
        }
        let series = series_from_values("us_stocks", 1900, &values);
        let mut scenario = scenario_with_returns("us_stocks:100;", &[series], 30, 3.0);
        scenario.flexibility = Flexibility::Market;
        scenario.flexibility_threshold_1 = 0.9;
        scenario.flexibility_change_1 = 0.9;
        scenario.flexibility_threshold_2 = 0.7;
        scenario.flexibility_change_2 = 0.7;

        let (mut window, _) = single_window::<1>(&scenario);
        for _ in 0..24 {
            window.step_month();
            window.ctx.months += 1;
        }
        assert!(window.ctx.flexible);
        let drawdown_high = window.ctx.historical_high;

        for _ in 24..48 {
            window.step_month();
            window.ctx.months += 1;
        }
        assert!(window.ctx.historical_high > drawdown_high);
    }

    #[test]
    fn cash_buffer_extends_simple_strategy() {
        let mut scenario = flat_scenario("us_stocks:100;", 30, 4.0);
        scenario.initial_cash = 200.0;
        scenario.cash_method = CashMethod::Simple;

        let without_cash = flat_scenario("us_stocks:100;", 30, 4.0);

        let (failed_with, ..) = run_single_window::<1>(&scenario);
        let (failed_without, ..) = run_single_window::<1>(&without_cash);

        match (failed_with, failed_without) {
            (Some(with), Some(without)) => assert!(with > without),
            (None, Some(_)) => {}
            other => panic!("unexpected outcomes {other:?}"),
        }
    }

    #[test]
    fn smart_cash_skips_the_buffer_below_the_nominal_rate() {
        // After a rising first year the effective monthly rate is well under
        // the nominal one, so the smart buffer stays untouched in year two.
        let rising = constant_returns("us_stocks", 1900, 1940, 1.01);
        let mut scenario = scenario_with_returns("us_stocks:100;", &[rising], 10, 4.0);
        scenario.initial_cash = 100.0;
        scenario.cash_method = CashMethod::Smart;

        let mut acc = Accumulator::new();
        let (mut window, _) = single_window::<1>(&scenario);
        for _ in 0..12 {
            window.step_month();
            window.ctx.months += 1;
        }
        window.end_year(&mut acc, 1900);
        let cash_after_year_one = window.ctx.cash;
        for _ in 0..12 {
            window.step_month();
            window.ctx.months += 1;
        }
        assert_eq!(window.ctx.cash, cash_after_year_one);

        // A falling first year pushes the effective rate above the nominal
        // one, so year two draws the buffer down.
        let falling = constant_returns("us_stocks", 1900, 1940, 0.99);
        let mut scenario = scenario_with_returns("us_stocks:100;", &[falling], 10, 4.0);
        scenario.initial_cash = 100.0;
        scenario.cash_method = CashMethod::Smart;

        let mut acc = Accumulator::new();
        let (mut window, _) = single_window::<1>(&scenario);
        for _ in 0..12 {
            window.step_month();
            window.ctx.months += 1;
        }
        window.end_year(&mut acc, 1900);
        let cash_after_year_one = window.ctx.cash;
        for _ in 0..12 {
            window.step_month();
            window.ctx.months += 1;
        }
        assert!(window.ctx.cash < cash_after_year_one);
    }

    #[test]
    fn selection_debits_the_designated_asset_first() {
        let mut scenario = flat_scenario("us_stocks:60;us_bonds:40;", 10, 4.0);
        scenario.selection = WithdrawalSelection::BondsFirst;

        let (mut window, _) = single_window::<2>(&scenario);
        window.step_month();

        let monthly = 1000.0 * 4.0 / 100.0 / 12.0;
        assert!((window.current_values[0] - 600.0).abs() < 1e-3);
        assert!((window.current_values[1] - (400.0 - monthly)).abs() < 1e-3);
    }

    #[test]
    fn selection_overflows_when_the_designated_asset_runs_dry() {
        let mut scenario = flat_scenario("us_stocks:99;us_bonds:1;", 10, 12.0);
        scenario.selection = WithdrawalSelection::BondsFirst;

        let (mut window, _) = single_window::<2>(&scenario);
        // Yearly withdrawal 120, monthly 10; bonds hold 10 and empty in the
        // first month, the second month overflows into stocks.
        window.step_month();
        window.ctx.months += 1;
        window.step_month();

        assert!(window.current_values[1].abs() < 1e-3);
        assert!(window.current_values[0] < 990.0);
    }

    #[test]
    fn selection_is_equivalent_on_a_single_asset() {
        let base = flat_scenario("us_stocks:100;us_bonds:0;", 15, 3.5);

        let mut results = Vec::new();
        for selection in [
            WithdrawalSelection::Allocation,
            WithdrawalSelection::StocksFirst,
            WithdrawalSelection::BondsFirst,
        ] {
            let mut scenario = base.clone();
            scenario.selection = selection;
            results.push(run::<2>(&scenario, 1900, 1960, 15, String::new(), Instant::now()));
        }

        for pair in results.windows(2) {
            assert_eq!(pair[0].successes, pair[1].successes);
            assert!((pair[0].tv_average - pair[1].tv_average).abs() < 1e-2);
            assert!((pair[0].total_withdrawn - pair[1].total_withdrawn).abs() < 1e-1);
        }
    }

    #[test]
    fn two_asset_kernel_with_empty_second_matches_single_asset() {
        let two = flat_scenario("us_stocks:100;us_bonds:0;", 15, 3.5);
        let one = flat_scenario("us_stocks:100;", 15, 3.5);

        let results_two = run::<2>(&two, 1900, 1960, 15, String::new(), Instant::now());
        let results_one = run::<1>(&one, 1900, 1960, 15, String::new(), Instant::now());

        assert_eq!(results_two.successes, results_one.successes);
        assert_eq!(results_two.failures, results_one.failures);
        assert!((results_two.tv_average - results_one.tv_average).abs() < 1e-2);
        assert!((results_two.tv_median - results_one.tv_median).abs() < 1e-2);
    }

    #[test]
    fn withdrawal_event_count_matches_the_frequency() {
        for frequency in [1_usize, 2, 3, 6, 12, 7] {
            let mut scenario = flat_scenario("us_stocks:100;", 10, 1.0);
            scenario.withdraw_frequency = frequency;

            // Never closing the year lets year_spending accumulate the whole
            // window, so withdrawal events show up as increases.
            let (mut window, _) = single_window::<1>(&scenario);
            let mut events = 0;
            for _ in 0..120 {
                let before = window.year_spending;
                window.step_month();
                if window.year_spending > before {
                    events += 1;
                }
                window.ctx.months += 1;
            }

            assert_eq!(events, 120_usize.div_ceil(frequency), "frequency {frequency}");
            // A full 10 years of withdrawals at 1% regardless of frequency.
            assert!(
                (window.year_spending - 100.0).abs() < 1e-2,
                "frequency {frequency}"
            );
            assert_eq!(window.year_spending, window.ctx.year_withdrawn);
        }
    }

    #[test]
    fn effective_wr_coordinates_stay_inside_the_window_bounds() {
        let scenario = flat_scenario("us_stocks:100;", 20, 2.0);
        let results = run::<1>(&scenario, 1900, 1960, 20, String::new(), Instant::now());

        for (start_year, start_month, year) in [
            (
                results.lowest_eff_wr_start_year,
                results.lowest_eff_wr_start_month,
                results.lowest_eff_wr_year,
            ),
            (
                results.highest_eff_wr_start_year,
                results.highest_eff_wr_start_month,
                results.highest_eff_wr_year,
            ),
        ] {
            assert!((1900..=1940).contains(&start_year));
            assert!((1..=12).contains(&start_month));
            assert!(year >= start_year && year <= start_year + 20);
        }
    }

    #[test]
    fn timeout_marks_partial_results() {
        let scenario = flat_scenario("us_stocks:100;", 20, 2.0);
        let mut with_timeout = scenario.clone();
        with_timeout.timeout_msecs = 1;

        let started = Instant::now() - std::time::Duration::from_millis(50);
        let results = run::<1>(&with_timeout, 1900, 1960, 20, String::new(), started);

        assert!(results.error);
        assert!(results.message.contains("did not finish"));
        // Exactly one window completed before the first timeout check.
        assert_eq!(results.successes + results.failures, 1);
    }

    #[test]
    fn exchange_rates_apply_to_flagged_assets() {
        let mut scenario = flat_scenario("us_stocks:100;", 10, 0.0);
        let exchange = constant_returns("usd_chf", 1900, 1960, 0.999);
        scenario.exchange_rates = vec![Some(Arc::new(exchange))];

        let (failed, _, terminal) = run_single_window::<1>(&scenario);
        assert!(failed.is_none());
        // 119 months of currency decay (first multiplier is the neutral 1.0).
        let expected = 1000.0 * 0.999_f32.powi(119);
        assert!((terminal - expected).abs() < 1.0);
    }

    proptest! {
        #[test]
        fn prop_inflation_neutral_fixed_wr_has_linear_terminal_value(
            wr_bp in 50_u32..280,
            years in 5_usize..25,
        ) {
            let wr = wr_bp as f32 / 100.0;
            let scenario = flat_scenario("us_stocks:100;", years, wr);
            let results = run::<1>(&scenario, 1900, 1960, years, String::new(), Instant::now());

            let expected = 1000.0 * (1.0 - wr * years as f32 / 100.0);
            prop_assert!(results.failures == 0);
            prop_assert!((results.tv_average - expected).abs() < 1.0);
            prop_assert!((results.tv_minimum - expected).abs() < 1.0);
            prop_assert!((results.tv_maximum - expected).abs() < 1.0);
        }

        #[test]
        fn prop_success_rate_is_bounded_and_counts_add_up(
            wr_bp in 100_u32..900,
            years in 5_usize..30,
        ) {
            let scenario = flat_scenario("us_stocks:100;", years, wr_bp as f32 / 100.0);
            let results = run::<1>(&scenario, 1900, 1960, years, String::new(), Instant::now());

            prop_assert!(results.success_rate >= 0.0);
            prop_assert!(results.success_rate <= 100.0);
            prop_assert!(
                results.successes + results.failures == (1960 - 1900 - years + 1) * 12
            );
        }
    }
}
