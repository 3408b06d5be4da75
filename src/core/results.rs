//! Aggregation of per-window outcomes into the final distribution summary.

use serde::Serialize;

use super::error::SimulationError;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Results {
    pub successes: usize,
    pub failures: usize,
    pub success_rate: f32,

    pub tv_average: f32,
    pub tv_minimum: f32,
    pub tv_maximum: f32,
    pub tv_median: f32,

    /// Months survived by the fastest-failing window, 0 when every window
    /// succeeded.
    pub worst_duration: usize,
    pub worst_starting_month: u16,
    pub worst_starting_year: u16,

    pub lowest_eff_wr: f32,
    pub lowest_eff_wr_start_month: u16,
    pub lowest_eff_wr_start_year: u16,
    pub lowest_eff_wr_year: u16,

    pub highest_eff_wr: f32,
    pub highest_eff_wr_start_month: u16,
    pub highest_eff_wr_start_year: u16,
    pub highest_eff_wr_year: u16,

    pub worst_tv: f32,
    pub worst_tv_month: u16,
    pub worst_tv_year: u16,
    pub best_tv: f32,
    pub best_tv_month: u16,
    pub best_tv_year: u16,

    pub total_withdrawn: f32,
    pub withdrawn_per_year: f32,

    pub spending_minimum: f32,
    pub spending_average: f32,
    pub spending_median: f32,
    pub spending_maximum: f32,

    pub years_small_spending: usize,
    pub years_large_spending: usize,
    pub years_volatile_up_spending: usize,
    pub years_volatile_down_spending: usize,

    pub flexible_successes: usize,
    pub flexible_failures: usize,

    #[serde(skip)]
    pub terminal_values: Vec<f32>,
    #[serde(skip)]
    pub flexible: Vec<bool>,

    pub message: String,
    pub error: bool,
}

impl Results {
    pub fn from_error(error: SimulationError) -> Self {
        Results {
            message: error.to_string(),
            error: true,
            ..Results::default()
        }
    }
}

/// Collects raw per-window outcomes during a simulation and collapses them
/// into a `Results` at the end.
#[derive(Debug, Default)]
pub struct Accumulator {
    terminal_values: Vec<f32>,
    flexible: Vec<bool>,
    spending: Vec<Vec<f32>>,

    successes: usize,
    failures: usize,
    flexible_successes: usize,
    flexible_failures: usize,

    total_withdrawn: f32,

    worst_duration: usize,
    worst_starting_month: u16,
    worst_starting_year: u16,

    lowest_eff_wr: Option<(f32, u16, u16, u16)>,
    highest_eff_wr: Option<(f32, u16, u16, u16)>,

    worst_tv: Option<(f32, u16, u16)>,
    best_tv: Option<(f32, u16, u16)>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn windows(&self) -> usize {
        self.terminal_values.len()
    }

    pub fn add_withdrawn(&mut self, amount: f32) {
        self.total_withdrawn += amount;
    }

    /// Record one calendar year's effective withdrawal rate, as a fraction.
    pub fn record_effective_wr(
        &mut self,
        eff_wr: f32,
        start_month: u16,
        start_year: u16,
        year: u16,
    ) {
        let candidate = (eff_wr, start_month, start_year, year);
        match self.lowest_eff_wr {
            Some((lowest, ..)) if lowest <= eff_wr => {}
            _ => self.lowest_eff_wr = Some(candidate),
        }
        match self.highest_eff_wr {
            Some((highest, ..)) if highest >= eff_wr => {}
            _ => self.highest_eff_wr = Some(candidate),
        }
    }

    pub fn record_window(
        &mut self,
        start_year: u16,
        start_month: u16,
        failed_at: Option<usize>,
        terminal_value: f32,
        flexible: bool,
        spending: Vec<f32>,
    ) {
        let terminal_value = if failed_at.is_some() { 0.0 } else { terminal_value };

        if let Some(months) = failed_at {
            self.failures += 1;
            if flexible {
                self.flexible_failures += 1;
            }
            if self.worst_duration == 0 || months < self.worst_duration {
                self.worst_duration = months;
                self.worst_starting_month = start_month;
                self.worst_starting_year = start_year;
            }
        } else {
            self.successes += 1;
            if flexible {
                self.flexible_successes += 1;
            }
            self.spending.push(spending);
        }

        match self.worst_tv {
            Some((worst, ..)) if worst <= terminal_value => {}
            _ => self.worst_tv = Some((terminal_value, start_month, start_year)),
        }
        match self.best_tv {
            Some((best, ..)) if best >= terminal_value => {}
            _ => self.best_tv = Some((terminal_value, start_month, start_year)),
        }

        self.terminal_values.push(terminal_value);
        self.flexible.push(flexible);
    }

    pub fn finish(self, years: usize, message: String) -> Results {
        let mut results = Results {
            successes: self.successes,
            failures: self.failures,
            total_withdrawn: self.total_withdrawn,
            worst_duration: self.worst_duration,
            worst_starting_month: self.worst_starting_month,
            worst_starting_year: self.worst_starting_year,
            flexible_successes: self.flexible_successes,
            flexible_failures: self.flexible_failures,
            message,
            ..Results::default()
        };

        let windows = self.successes + self.failures;
        if windows > 0 {
            results.success_rate = 100.0 * self.successes as f32 / windows as f32;
        }

        if let Some((eff, month, year, y)) = self.lowest_eff_wr {
            results.lowest_eff_wr = 100.0 * eff;
            results.lowest_eff_wr_start_month = month;
            results.lowest_eff_wr_start_year = year;
            results.lowest_eff_wr_year = y;
        }
        if let Some((eff, month, year, y)) = self.highest_eff_wr {
            results.highest_eff_wr = 100.0 * eff;
            results.highest_eff_wr_start_month = month;
            results.highest_eff_wr_start_year = year;
            results.highest_eff_wr_year = y;
        }
        if let Some((tv, month, year)) = self.worst_tv {
            results.worst_tv = tv;
            results.worst_tv_month = month;
            results.worst_tv_year = year;
        }
        if let Some((tv, month, year)) = self.best_tv {
            results.best_tv = tv;
            results.best_tv_month = month;
            results.best_tv_year = year;
        }

        if self.successes > 0 {
            results.withdrawn_per_year =
                self.total_withdrawn / years as f32 / self.successes as f32;
        }

        let mut terminal_values = self.terminal_values;
        if !terminal_values.is_empty() {
            terminal_values.sort_by(|a, b| a.total_cmp(b));
            results.tv_minimum = terminal_values[0];
            results.tv_maximum = terminal_values[terminal_values.len() - 1];
            results.tv_average =
                terminal_values.iter().sum::<f32>() / terminal_values.len() as f32;
            results.tv_median = upper_median(&terminal_values);
        }
        results.terminal_values = terminal_values;
        results.flexible = self.flexible;

        collapse_spending(&self.spending, years, &mut results);

        results
    }
}

fn collapse_spending(spending: &[Vec<f32>], years: usize, results: &mut Results) {
    if spending.is_empty() || years == 0 {
        return;
    }

    let mut totals = Vec::with_capacity(spending.len());

    for window in spending {
        let Some(&first) = window.first() else {
            continue;
        };

        let mut previous = None;
        for &year_spending in window {
            if year_spending >= 1.5 * first {
                results.years_large_spending += 1;
            }
            if year_spending <= 0.5 * first {
                results.years_small_spending += 1;
            }
            if let Some(previous) = previous {
                if year_spending >= 1.1 * previous {
                    results.years_volatile_up_spending += 1;
                }
                if year_spending <= 0.9 * previous {
                    results.years_volatile_down_spending += 1;
                }
            }
            previous = Some(year_spending);
        }

        totals.push(window.iter().sum::<f32>());
    }

    if totals.is_empty() {
        return;
    }

    totals.sort_by(|a, b| a.total_cmp(b));
    let years = years as f32;
    results.spending_minimum = totals[0] / years;
    results.spending_maximum = totals[totals.len() - 1] / years;
    results.spending_average = totals.iter().sum::<f32>() / totals.len() as f32 / years;
    results.spending_median = upper_median(&totals) / years;
}

/// The historical upper-median convention: `sorted[n/2 + 1]`, clamped so a
/// degenerate sample cannot index out of bounds.
fn upper_median(sorted: &[f32]) -> f32 {
    sorted[(sorted.len() / 2 + 1).min(sorted.len() - 1)]
}
