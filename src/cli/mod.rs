//! Command-line studies. Every subcommand parameterizes the engine, runs
//! it, and prints either a human summary, a spreadsheet sheet (semicolon
//! separated rows), or a graph block (an `x` row followed by labelled `y`
//! rows). Printers only ever read `Results` values.

use std::fmt::Display;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};

use crate::core::{
    find_max_withdrawal_rate, load_data, load_inflation, load_portfolio_series,
    normalize_portfolio, parse_portfolio, simulate, simulations_ran, sweep_withdrawal_rates,
    total_allocation, withdrawal_rate_grid, CashMethod, Flexibility, Rebalancing, Results,
    Scenario, SimulationError, WithdrawalMethod, WithdrawalSelection,
};

#[derive(Parser, Debug)]
#[command(
    name = "swr",
    about = "Historical safe-withdrawal-rate simulator for retirement portfolios"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct PeriodArgs {
    years: usize,
    start: u16,
    end: u16,
    portfolio: String,
    inflation: String,
    #[arg(default_value = "none")]
    rebalance: String,
}

#[derive(Args, Debug)]
struct FixedArgs {
    wr: f32,
    years: usize,
    start: u16,
    end: u16,
    portfolio: String,
    inflation: String,
    #[arg(default_value = "none")]
    rebalance: String,
}

/// The fully-positional form used by commands that take study-specific
/// arguments after the rebalancing policy.
#[derive(Args, Debug)]
struct StudyArgs {
    wr: f32,
    years: usize,
    start: u16,
    end: u16,
    portfolio: String,
    inflation: String,
    rebalance: String,
}

impl StudyArgs {
    fn to_fixed(&self) -> FixedArgs {
        FixedArgs {
            wr: self.wr,
            years: self.years,
            start: self.start,
            end: self.end,
            portfolio: self.portfolio.clone(),
            inflation: self.inflation.clone(),
            rebalance: self.rebalance.clone(),
        }
    }

}

#[derive(Subcommand, Debug)]
#[command(rename_all = "snake_case")]
enum Command {
    /// Success rate and distributions for one withdrawal rate.
    Fixed(FixedArgs),
    /// Highest withdrawal rate reaching a success-rate target.
    Swr {
        #[command(flatten)]
        period: PeriodArgs,
        #[arg(default_value_t = 95.0)]
        success: f32,
    },
    /// Success rates for withdrawal rates between 3% and 5%.
    MultipleWr(PeriodArgs),
    /// One withdrawal rate across withdrawal frequencies.
    WithdrawFrequency(FixedArgs),
    /// Withdrawal-rate sweep for every common withdrawal frequency.
    Frequency(PeriodArgs),
    /// Return statistics for every asset of a portfolio.
    Analysis {
        start: u16,
        end: u16,
        portfolio: String,
    },
    /// Blended yearly return statistics for a portfolio.
    PortfolioAnalysis {
        start: u16,
        end: u16,
        portfolio: String,
        inflation: String,
    },
    /// Success rates across the stock/bond allocation grid.
    Allocation(FixedArgs),
    /// Success rates across retirement durations.
    Term {
        wr: f32,
        start: u16,
        end: u16,
        portfolio: String,
        inflation: String,
        #[arg(default_value = "none")]
        rebalance: String,
    },
    /// Equity glidepath toward a target allocation.
    Glidepath {
        #[command(flatten)]
        study: StudyArgs,
        pass: f32,
        goal: f32,
    },
    /// Equity glidepath away from stocks (negative pass).
    ReverseGlidepath {
        #[command(flatten)]
        study: StudyArgs,
        pass: f32,
        goal: f32,
    },
    /// Highest withdrawal rate that never failed historically.
    Failsafe(PeriodArgs),
    /// Dump a series, normalized and as monthly returns.
    DataGraph { series: String },
    /// Dump a series with calendar labels.
    DataTimeGraph { series: String },
    /// Success-rate sheet over the 3-6% rate grid.
    TrinitySuccessSheets(PeriodArgs),
    /// Success-rate graph over the 3-6% rate grid.
    TrinitySuccessGraph(PeriodArgs),
    /// Worst-duration sheet over the rate grid.
    TrinityDurationSheets(PeriodArgs),
    /// Worst-duration graph over the rate grid.
    TrinityDurationGraph(PeriodArgs),
    /// Terminal-value distribution sheet over the rate grid.
    TrinityTvSheets(PeriodArgs),
    /// Terminal-value distribution graph over the rate grid.
    TrinityTvGraph(PeriodArgs),
    /// Spending distribution sheet over the rate grid.
    TrinitySpendingSheets(PeriodArgs),
    /// Spending distribution graph over the rate grid.
    TrinitySpendingGraph(PeriodArgs),
    /// Success sheet with bond yields scaled toward zero.
    TrinityLowYieldSheets {
        years: usize,
        start: u16,
        end: u16,
        portfolio: String,
        inflation: String,
        rebalance: String,
        yield_adjust: f32,
    },
    /// Success graph with bond yields scaled toward zero.
    TrinityLowYieldGraph {
        years: usize,
        start: u16,
        end: u16,
        portfolio: String,
        inflation: String,
        rebalance: String,
        yield_adjust: f32,
    },
    /// Success rates for none/monthly/yearly rebalancing.
    RebalanceSheets(PeriodArgs),
    /// Graph of success rates for none/monthly/yearly rebalancing.
    RebalanceGraph(PeriodArgs),
    /// Success rates across threshold-rebalancing thresholds.
    ThresholdRebalanceSheets(PeriodArgs),
    /// Graph of success rates across rebalancing thresholds.
    ThresholdRebalanceGraph(PeriodArgs),
    /// Percentage-of-current withdrawals with a minimum floor.
    CurrentWr {
        #[command(flatten)]
        period: PeriodArgs,
        #[arg(default_value_t = 0.03)]
        minimum: f32,
    },
    /// Graph of percentage-of-current withdrawals.
    CurrentWrGraph {
        #[command(flatten)]
        period: PeriodArgs,
        #[arg(default_value_t = 0.03)]
        minimum: f32,
    },
    /// Success rates across social-security coverages.
    SocialSheets {
        #[command(flatten)]
        study: StudyArgs,
        delay: usize,
    },
    /// Graph of success rates across social-security coverages.
    SocialGraph {
        #[command(flatten)]
        study: StudyArgs,
        delay: usize,
    },
    /// Social-security coverage sweep across stock allocations.
    SocialPfSheets {
        #[command(flatten)]
        study: StudyArgs,
        delay: usize,
    },
    /// Graph of the social-security allocation sweep.
    SocialPfGraph {
        #[command(flatten)]
        study: StudyArgs,
        delay: usize,
    },
    /// Delivered yearly income across withdrawal rates.
    IncomeGraph(PeriodArgs),
    /// Flexible-withdrawal study for one threshold pair.
    FlexibilityGraph {
        years: usize,
        start: u16,
        end: u16,
        portfolio: String,
        inflation: String,
        rebalance: String,
        model: String,
        threshold_1: f32,
        change_1: f32,
        threshold_2: f32,
        change_2: f32,
    },
    /// Flexible-withdrawal study across a grid of threshold pairs.
    FlexibilityAutoGraph {
        years: usize,
        start: u16,
        end: u16,
        portfolio: String,
        inflation: String,
        rebalance: String,
        model: String,
    },
    /// Compare withdrawal-selection policies across rates.
    SelectionGraph(PeriodArgs),
    /// Success rates across cash-buffer sizes.
    TrinityCash {
        #[command(flatten)]
        study: StudyArgs,
        cash_method: String,
        months_of_cash: usize,
    },
    /// Graph of success rates across cash-buffer sizes.
    TrinityCashGraph {
        #[command(flatten)]
        study: StudyArgs,
        cash_method: String,
        months_of_cash: usize,
    },
    /// Graphs for both cash strategies side by side.
    TrinityCashGraphs {
        #[command(flatten)]
        study: StudyArgs,
        months_of_cash: usize,
    },
    /// Wall-clock timing across retirement durations.
    TimesGraph(PeriodArgs),
    /// Serve the HTTP API.
    Server { listen: String, port: u16 },
}

/// Parse the command line and run it. Returns the process exit code.
pub async fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            // clap renders --help and version through errors as well.
            let _ = error.print();
            return if error.use_stderr() { 1 } else { 0 };
        }
    };

    match dispatch(cli.command).await {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("{error}");
            1
        }
    }
}

async fn dispatch(command: Command) -> Result<(), SimulationError> {
    match command {
        Command::Fixed(args) => fixed(args),
        Command::Swr { period, success } => swr_search(period, success),
        Command::MultipleWr(args) => multiple_wr(args),
        Command::WithdrawFrequency(args) => withdraw_frequency(args),
        Command::Frequency(args) => frequency(args),
        Command::Analysis { start, end, portfolio } => analysis(start, end, &portfolio),
        Command::PortfolioAnalysis { start, end, portfolio, inflation } => {
            portfolio_analysis(start, end, &portfolio, &inflation)
        }
        Command::Allocation(args) => allocation(args),
        Command::Term { wr, start, end, portfolio, inflation, rebalance } => {
            term(wr, start, end, &portfolio, &inflation, &rebalance)
        }
        Command::Glidepath { study, pass, goal } => glidepath(study.to_fixed(), pass.abs(), goal),
        Command::ReverseGlidepath { study, pass, goal } => {
            glidepath(study.to_fixed(), -pass.abs(), goal)
        }
        Command::Failsafe(args) => failsafe(args),
        Command::DataGraph { series } => data_graph(&series, false),
        Command::DataTimeGraph { series } => data_graph(&series, true),
        Command::TrinitySuccessSheets(args) => trinity_success(args, Format::Sheet),
        Command::TrinitySuccessGraph(args) => trinity_success(args, Format::Graph),
        Command::TrinityDurationSheets(args) => trinity_duration(args, Format::Sheet),
        Command::TrinityDurationGraph(args) => trinity_duration(args, Format::Graph),
        Command::TrinityTvSheets(args) => trinity_tv(args, Format::Sheet),
        Command::TrinityTvGraph(args) => trinity_tv(args, Format::Graph),
        Command::TrinitySpendingSheets(args) => trinity_spending(args, Format::Sheet),
        Command::TrinitySpendingGraph(args) => trinity_spending(args, Format::Graph),
        Command::TrinityLowYieldSheets {
            years,
            start,
            end,
            portfolio,
            inflation,
            rebalance,
            yield_adjust,
        } => trinity_low_yield(
            PeriodArgs { years, start, end, portfolio, inflation, rebalance },
            yield_adjust,
            Format::Sheet,
        ),
        Command::TrinityLowYieldGraph {
            years,
            start,
            end,
            portfolio,
            inflation,
            rebalance,
            yield_adjust,
        } => trinity_low_yield(
            PeriodArgs { years, start, end, portfolio, inflation, rebalance },
            yield_adjust,
            Format::Graph,
        ),
        Command::RebalanceSheets(args) => rebalance_study(args, Format::Sheet),
        Command::RebalanceGraph(args) => rebalance_study(args, Format::Graph),
        Command::ThresholdRebalanceSheets(args) => threshold_rebalance(args, Format::Sheet),
        Command::ThresholdRebalanceGraph(args) => threshold_rebalance(args, Format::Graph),
        Command::CurrentWr { period, minimum } => current_wr(period, minimum, Format::Sheet),
        Command::CurrentWrGraph { period, minimum } => current_wr(period, minimum, Format::Graph),
        Command::SocialSheets { study, delay } => social(study.to_fixed(), delay, Format::Sheet),
        Command::SocialGraph { study, delay } => social(study.to_fixed(), delay, Format::Graph),
        Command::SocialPfSheets { study, delay } => {
            social_pf(study.to_fixed(), delay, Format::Sheet)
        }
        Command::SocialPfGraph { study, delay } => {
            social_pf(study.to_fixed(), delay, Format::Graph)
        }
        Command::IncomeGraph(args) => income_graph(args),
        Command::FlexibilityGraph {
            years,
            start,
            end,
            portfolio,
            inflation,
            rebalance,
            model,
            threshold_1,
            change_1,
            threshold_2,
            change_2,
        } => flexibility_graph(
            PeriodArgs { years, start, end, portfolio, inflation, rebalance },
            &model,
            (threshold_1, change_1),
            (threshold_2, change_2),
        ),
        Command::FlexibilityAutoGraph {
            years,
            start,
            end,
            portfolio,
            inflation,
            rebalance,
            model,
        } => flexibility_auto_graph(
            PeriodArgs { years, start, end, portfolio, inflation, rebalance },
            &model,
        ),
        Command::SelectionGraph(args) => selection_graph(args),
        Command::TrinityCash { study, cash_method, months_of_cash } => {
            trinity_cash(study.to_fixed(), &cash_method, months_of_cash, Format::Sheet)
        }
        Command::TrinityCashGraph { study, cash_method, months_of_cash } => {
            trinity_cash(study.to_fixed(), &cash_method, months_of_cash, Format::Graph)
        }
        Command::TrinityCashGraphs { study, months_of_cash } => {
            trinity_cash(study.to_fixed(), "simple", months_of_cash, Format::Graph)?;
            trinity_cash(study.to_fixed(), "smart", months_of_cash, Format::Graph)
        }
        Command::TimesGraph(args) => times_graph(args),
        Command::Server { listen, port } => crate::api::run_http_server(&listen, port)
            .await
            .map_err(|e| SimulationError::Configuration(format!("server error: {e}"))),
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum Format {
    Sheet,
    Graph,
}

fn scenario_from_period(args: &PeriodArgs, wr: f32) -> Result<Scenario, SimulationError> {
    let mut scenario = Scenario::load(
        &args.portfolio,
        &args.inflation,
        args.years,
        wr,
        args.start,
        args.end,
    )?;
    scenario.rebalance = Rebalancing::parse(&args.rebalance)?;
    Ok(scenario)
}

/// Like `scenario_from_period`, but keeps a zero-sum portfolio (the
/// allocation-sweep form) instead of rejecting it.
fn scenario_for_sweep(args: &PeriodArgs, wr: f32) -> Result<Scenario, SimulationError> {
    let mut portfolio = parse_portfolio(&args.portfolio, true)?;
    normalize_portfolio(&mut portfolio);

    let values = load_portfolio_series(&portfolio)?;
    let inflation = load_inflation(&values, &args.inflation)?;

    let mut scenario = Scenario::new(
        portfolio,
        values,
        inflation,
        args.years,
        wr,
        args.start,
        args.end,
    );
    scenario.rebalance = Rebalancing::parse(&args.rebalance)?;
    Ok(scenario)
}

fn scenario_from_fixed(args: &FixedArgs) -> Result<Scenario, SimulationError> {
    let mut scenario = Scenario::load(
        &args.portfolio,
        &args.inflation,
        args.years,
        args.wr,
        args.start,
        args.end,
    )?;
    scenario.rebalance = Rebalancing::parse(&args.rebalance)?;
    Ok(scenario)
}

fn portfolio_label(scenario: &Scenario) -> String {
    let mut label = String::new();
    for position in &scenario.portfolio {
        if position.allocation > 0.0 {
            label.push_str(&format!("{}% {} ", position.allocation, position.asset));
        }
    }
    label
}

fn print_row<T: Display>(label: impl Display, values: impl IntoIterator<Item = T>) {
    print!("{label}");
    for value in values {
        print!(";{value}");
    }
    println!();
}

fn print_rate_header(label: &str, rates: &[f32]) {
    print!("{label}");
    for wr in rates {
        print!(";{wr}%");
    }
    println!();
}

fn print_graph_x(rates: &[f32]) {
    print_row("x", rates.iter().copied());
}

fn throughput_line(started: Instant) {
    let elapsed = started.elapsed().as_millis().max(1) as usize;
    println!(
        "Computed {} simulations in {elapsed}ms ({}/s)",
        simulations_ran(),
        1000 * simulations_ran() / elapsed
    );
}

fn fail_on_error(results: &Results) -> Result<(), SimulationError> {
    if results.error {
        Err(SimulationError::Configuration(results.message.clone()))
    } else {
        Ok(())
    }
}

fn print_summary(label: &str, results: &Results) {
    println!(
        "     Success Rate ({label}): ({}/{}) {:.2}% [avg:{:.0} med:{:.0} min:{:.0} max:{:.0}]",
        results.successes,
        results.successes + results.failures,
        results.success_rate,
        results.tv_average,
        results.tv_median,
        results.tv_minimum,
        results.tv_maximum,
    );

    if results.failures > 0 {
        println!(
            "         Worst duration: {} months ({}/{})",
            results.worst_duration, results.worst_starting_month, results.worst_starting_year
        );
    }

    println!(
        "        Highest Eff. WR: {:.2}% ({}/{} -> {})",
        results.highest_eff_wr,
        results.highest_eff_wr_start_month,
        results.highest_eff_wr_start_year,
        results.highest_eff_wr_year
    );
    println!(
        "         Lowest Eff. WR: {:.2}% ({}/{} -> {})",
        results.lowest_eff_wr,
        results.lowest_eff_wr_start_month,
        results.lowest_eff_wr_start_year,
        results.lowest_eff_wr_year
    );
    println!(
        "         Withdrawn/year: {:.2} (total {:.0})",
        results.withdrawn_per_year, results.total_withdrawn
    );
}

fn fixed(args: FixedArgs) -> Result<(), SimulationError> {
    let scenario = scenario_from_fixed(&args)?;

    println!("Withdrawal Rate (WR): {}%", args.wr);
    println!("     Number of years: {}", args.years);
    println!("               Start: {}", args.start);
    println!("                 End: {}", args.end);
    println!("           Portfolio:");
    for position in &scenario.portfolio {
        println!("             {}: {}%", position.asset, position.allocation);
    }

    let started = Instant::now();

    let monthly = simulate(&scenario);
    if !monthly.message.is_empty() {
        println!("{}", monthly.message);
    }
    fail_on_error(&monthly)?;
    print_summary("Monthly", &monthly);

    let mut yearly_scenario = scenario.clone();
    yearly_scenario.withdraw_frequency = 12;
    let yearly = simulate(&yearly_scenario);
    fail_on_error(&yearly)?;
    print_summary("Yearly", &yearly);

    throughput_line(started);
    Ok(())
}

fn swr_search(args: PeriodArgs, success: f32) -> Result<(), SimulationError> {
    let scenario = scenario_from_period(&args, 0.0)?;

    let started = Instant::now();
    let Some((wr, results)) = find_max_withdrawal_rate(&scenario, success, 0.01) else {
        return Err(SimulationError::Configuration(format!(
            "no withdrawal rate reaches {success}% success"
        )));
    };

    println!("SWR for {}% success over {} years: {wr:.2}%", success, args.years);
    print_summary("Monthly", &results);
    throughput_line(started);
    Ok(())
}

fn multiple_wr(args: PeriodArgs) -> Result<(), SimulationError> {
    let base = scenario_for_sweep(&args, 0.0)?;
    let started = Instant::now();

    run_allocation_variants(&base, 5.0, |scenario| {
        println!("           Portfolio:");
        for position in &scenario.portfolio {
            println!("             {}: {}%", position.asset, position.allocation);
        }
        println!();

        for wr in withdrawal_rate_grid(3.0, 5.0, 0.25) {
            let mut candidate = scenario.clone();
            candidate.wr = wr;
            candidate.withdraw_frequency = 12;
            let yearly = simulate(&candidate);
            fail_on_error(&yearly)?;
            println!(
                "{wr}% Success Rate (Yearly): ({}/{}) {:.2}% [{:.0}:{:.0}:{:.0}:{:.0}]",
                yearly.successes,
                yearly.successes + yearly.failures,
                yearly.success_rate,
                yearly.tv_average,
                yearly.tv_median,
                yearly.tv_minimum,
                yearly.tv_maximum
            );

            candidate.withdraw_frequency = 1;
            let monthly = simulate(&candidate);
            fail_on_error(&monthly)?;
            println!(
                "{wr}% Success Rate (Monthly): ({}/{}) {:.2}% [{:.0}:{:.0}:{:.0}:{:.0}]",
                monthly.successes,
                monthly.successes + monthly.failures,
                monthly.success_rate,
                monthly.tv_average,
                monthly.tv_median,
                monthly.tv_minimum,
                monthly.tv_maximum
            );
        }
        Ok(())
    })?;

    throughput_line(started);
    Ok(())
}

/// Run the closure once, or once per allocation step when the portfolio was
/// given zero-sum (the sweep form).
fn run_allocation_variants(
    base: &Scenario,
    step: f32,
    mut body: impl FnMut(&Scenario) -> Result<(), SimulationError>,
) -> Result<(), SimulationError> {
    if total_allocation(&base.portfolio) != 0.0 {
        return body(base);
    }

    if base.portfolio.len() != 2 {
        return Err(SimulationError::Configuration(
            "the allocation sweep requires exactly two assets".to_string(),
        ));
    }

    let mut allocation = 0.0_f32;
    while allocation <= 100.0 {
        let mut scenario = base.clone();
        scenario.portfolio[0].allocation = allocation;
        scenario.portfolio[1].allocation = 100.0 - allocation;
        body(&scenario)?;
        allocation += step;
    }
    Ok(())
}

fn withdraw_frequency(args: FixedArgs) -> Result<(), SimulationError> {
    let base = scenario_from_fixed(&args)?;
    let frequencies = [1_usize, 2, 3, 4, 6, 12];

    println!("Withdrawal frequencies for {}%:", args.wr);
    for frequency in frequencies {
        let mut scenario = base.clone();
        scenario.withdraw_frequency = frequency;
        let results = simulate(&scenario);
        fail_on_error(&results)?;
        println!(
            "  every {frequency:>2} months: {:.2}% [avg tv {:.0}]",
            results.success_rate, results.tv_average
        );
    }
    Ok(())
}

fn frequency(args: PeriodArgs) -> Result<(), SimulationError> {
    let base = scenario_from_period(&args, 0.0)?;
    let rates = withdrawal_rate_grid(3.0, 6.0, 0.25);

    print_rate_header("Frequency", &rates);
    for frequency in [1_usize, 2, 3, 4, 6, 12] {
        let mut scenario = base.clone();
        scenario.withdraw_frequency = frequency;
        let swept = sweep_withdrawal_rates(&scenario, &rates);
        print_row(
            frequency,
            swept.iter().map(|(_, results)| format!("{:.2}", results.success_rate)),
        );
    }
    Ok(())
}

fn series_statistics(values: &[f32]) -> (f32, f32) {
    let mean = values.iter().sum::<f32>() / values.len().max(1) as f32;
    let variance = values
        .iter()
        .map(|value| (value - mean) * (value - mean))
        .sum::<f32>()
        / values.len().max(1) as f32;
    (mean, variance.sqrt())
}

fn analysis(start: u16, end: u16, portfolio: &str) -> Result<(), SimulationError> {
    let scenario = Scenario::load(portfolio, "no_inflation", 1, 0.0, start, end)?;

    println!("Monthly returns between {start} and {end}:");
    for (i, position) in scenario.portfolio.iter().enumerate() {
        let series = &scenario.values[i];
        let from = series.index_of(start.max(series.start_year()), 1).unwrap_or(0);
        let to = series
            .index_of(end.min(series.end_year()), 12)
            .map(|index| index + 1)
            .unwrap_or(series.points.len());

        let monthly: Vec<f32> = series.points[from..to].iter().map(|p| p.value - 1.0).collect();
        let (mean, vol) = series_statistics(&monthly);
        println!(
            "  {:>14}: mean {:+.3}%  vol {:.3}%  ({} months)",
            position.asset,
            100.0 * mean,
            100.0 * vol,
            monthly.len()
        );
    }
    Ok(())
}

fn portfolio_analysis(
    start: u16,
    end: u16,
    portfolio: &str,
    inflation: &str,
) -> Result<(), SimulationError> {
    let scenario = Scenario::load(portfolio, inflation, 1, 0.0, start, end)?;
    let total = total_allocation(&scenario.portfolio).max(1e-6);

    let reference = &scenario.values[0];
    let mut yearly = Vec::new();
    let mut index = 0;
    while index + 12 <= reference.points.len() {
        let mut compounded = 1.0_f32;
        for month in 0..12 {
            let point = reference.points[index + month];
            if point.year < start || point.year > end {
                continue;
            }
            let mut blended = 0.0;
            for (i, position) in scenario.portfolio.iter().enumerate() {
                let value = scenario.values[i]
                    .index_of(point.year, point.month)
                    .map(|at| scenario.values[i].value_at(at))
                    .unwrap_or(1.0);
                blended += position.allocation / total * value;
            }
            compounded *= blended;
        }
        if compounded != 1.0 {
            yearly.push(compounded - 1.0);
        }
        index += 12;
    }

    let (mean, vol) = series_statistics(&yearly);
    println!("Portfolio {}", portfolio_label(&scenario));
    println!(
        "  yearly return: mean {:+.2}%  vol {:.2}%  over {} years",
        100.0 * mean,
        100.0 * vol,
        yearly.len()
    );
    Ok(())
}

fn allocation(args: FixedArgs) -> Result<(), SimulationError> {
    let portfolio = parse_portfolio(&args.portfolio, true)?;
    if portfolio.len() != 2 {
        return Err(SimulationError::Configuration(
            "the allocation study requires exactly two assets".to_string(),
        ));
    }

    let mut base = scenario_for_sweep(
        &PeriodArgs {
            years: args.years,
            start: args.start,
            end: args.end,
            portfolio: args.portfolio.clone(),
            inflation: args.inflation.clone(),
            rebalance: args.rebalance.clone(),
        },
        args.wr,
    )?;

    println!(
        "{}%: success rate per {} allocation",
        args.wr, base.portfolio[0].asset
    );
    let mut first = 0.0_f32;
    while first <= 100.0 {
        base.portfolio[0].allocation = first;
        base.portfolio[1].allocation = 100.0 - first;
        let results = simulate(&base);
        fail_on_error(&results)?;
        println!(
            "  {first:>5}%: {:.2}% [avg tv {:.0}]",
            results.success_rate, results.tv_average
        );
        first += 10.0;
    }
    Ok(())
}

fn term(
    wr: f32,
    start: u16,
    end: u16,
    portfolio: &str,
    inflation: &str,
    rebalance: &str,
) -> Result<(), SimulationError> {
    println!("Success rate of {wr}% per duration:");
    for years in (10..=50).step_by(5) {
        let mut scenario = Scenario::load(portfolio, inflation, years, wr, start, end)?;
        scenario.rebalance = Rebalancing::parse(rebalance)?;
        let results = simulate(&scenario);
        fail_on_error(&results)?;
        println!(
            "  {years:>2} years: {:.2}% [avg tv {:.0}]",
            results.success_rate, results.tv_average
        );
    }
    Ok(())
}

fn glidepath(args: FixedArgs, pass: f32, goal: f32) -> Result<(), SimulationError> {
    let mut scenario = scenario_from_fixed(&args)?;
    scenario.glidepath = true;
    scenario.gp_pass = pass;
    scenario.gp_goal = goal;

    let results = simulate(&scenario);
    if !results.message.is_empty() {
        println!("{}", results.message);
    }
    fail_on_error(&results)?;

    println!(
        "Glidepath {} -> {goal} by {pass}/month:",
        scenario.portfolio[0].allocation
    );
    print_summary("Monthly", &results);
    Ok(())
}

fn failsafe(args: PeriodArgs) -> Result<(), SimulationError> {
    let scenario = scenario_from_period(&args, 0.0)?;
    let started = Instant::now();

    let Some((wr, results)) = find_max_withdrawal_rate(&scenario, 100.0, 0.01) else {
        return Err(SimulationError::Configuration(
            "even a zero withdrawal rate fails on this period".to_string(),
        ));
    };

    println!("Failsafe WR over {} years: {wr:.2}%", args.years);
    print_summary("Monthly", &results);
    throughput_line(started);
    Ok(())
}

fn data_graph(series_name: &str, with_time: bool) -> Result<(), SimulationError> {
    let mut series = load_data(series_name)?;
    series.normalize();
    if series.points.is_empty() {
        return Err(SimulationError::MissingData(format!(
            "{series_name}: no full calendar year of data"
        )));
    }

    let mut returns = series.clone();
    returns.to_returns();

    if with_time {
        print_row(
            "x",
            series.points.iter().map(|p| format!("{}-{:02}", p.year, p.month)),
        );
    } else {
        print_graph_x(
            &(0..series.points.len()).map(|i| i as f32).collect::<Vec<_>>(),
        );
    }
    print_row(series_name, series.points.iter().map(|p| p.value));
    print_row(
        format!("{series_name}_returns"),
        returns.points.iter().map(|p| p.value),
    );
    Ok(())
}

fn print_success_rates(
    label: impl Display,
    scenario: &Scenario,
    rates: &[f32],
) -> Result<(), SimulationError> {
    let swept = sweep_withdrawal_rates(scenario, rates);
    for (_, results) in &swept {
        fail_on_error(results)?;
    }
    print_row(
        label,
        swept.iter().map(|(_, results)| format!("{:.2}", results.success_rate)),
    );
    Ok(())
}

fn trinity_success(args: PeriodArgs, format: Format) -> Result<(), SimulationError> {
    let base = scenario_for_sweep(&args, 0.0)?;
    let rates = withdrawal_rate_grid(3.0, 6.0, 0.1);

    match format {
        Format::Sheet => print_rate_header("Portfolio", &rates),
        Format::Graph => print_graph_x(&rates),
    }

    let started = Instant::now();
    run_allocation_variants(&base, 25.0, |scenario| {
        print_success_rates(portfolio_label(scenario), scenario, &rates)
    })?;

    if format == Format::Sheet {
        throughput_line(started);
    }
    Ok(())
}

fn trinity_duration(args: PeriodArgs, format: Format) -> Result<(), SimulationError> {
    let base = scenario_for_sweep(&args, 0.0)?;
    let rates = withdrawal_rate_grid(3.0, 6.0, 0.1);

    match format {
        Format::Sheet => print_rate_header("Portfolio", &rates),
        Format::Graph => print_graph_x(&rates),
    }

    run_allocation_variants(&base, 25.0, |scenario| {
        let swept = sweep_withdrawal_rates(scenario, &rates);
        for (_, results) in &swept {
            fail_on_error(results)?;
        }
        print_row(
            portfolio_label(scenario),
            swept.iter().map(|(_, results)| {
                // A sweep point with no failure survived the whole duration.
                if results.failures == 0 {
                    scenario.years * 12
                } else {
                    results.worst_duration
                }
            }),
        );
        Ok(())
    })
}

fn trinity_tv(args: PeriodArgs, format: Format) -> Result<(), SimulationError> {
    let scenario = scenario_from_period(&args, 0.0)?;
    let rates = withdrawal_rate_grid(3.0, 5.0, 0.25);

    match format {
        Format::Sheet => print_rate_header("Withdrawal Rate", &rates),
        Format::Graph => print_graph_x(&rates),
    }

    let swept = sweep_withdrawal_rates(&scenario, &rates);
    for (_, results) in &swept {
        fail_on_error(results)?;
    }

    print_row("MIN", swept.iter().map(|(_, r)| format!("{:.0}", r.tv_minimum)));
    print_row("AVG", swept.iter().map(|(_, r)| format!("{:.0}", r.tv_average)));
    print_row("MED", swept.iter().map(|(_, r)| format!("{:.0}", r.tv_median)));
    print_row("MAX", swept.iter().map(|(_, r)| format!("{:.0}", r.tv_maximum)));
    Ok(())
}

fn trinity_spending(args: PeriodArgs, format: Format) -> Result<(), SimulationError> {
    let scenario = scenario_from_period(&args, 0.0)?;
    let rates = withdrawal_rate_grid(3.0, 5.0, 0.25);

    match format {
        Format::Sheet => print_rate_header("Withdrawal Rate", &rates),
        Format::Graph => print_graph_x(&rates),
    }

    let swept = sweep_withdrawal_rates(&scenario, &rates);
    for (_, results) in &swept {
        fail_on_error(results)?;
    }

    print_row("MIN", swept.iter().map(|(_, r)| format!("{:.1}", r.spending_minimum)));
    print_row("AVG", swept.iter().map(|(_, r)| format!("{:.1}", r.spending_average)));
    print_row("MED", swept.iter().map(|(_, r)| format!("{:.1}", r.spending_median)));
    print_row("MAX", swept.iter().map(|(_, r)| format!("{:.1}", r.spending_maximum)));
    print_row("LARGE_YEARS", swept.iter().map(|(_, r)| r.years_large_spending));
    print_row("SMALL_YEARS", swept.iter().map(|(_, r)| r.years_small_spending));
    print_row("VOL_UP", swept.iter().map(|(_, r)| r.years_volatile_up_spending));
    print_row("VOL_DOWN", swept.iter().map(|(_, r)| r.years_volatile_down_spending));
    Ok(())
}

fn trinity_low_yield(
    args: PeriodArgs,
    yield_adjust: f32,
    format: Format,
) -> Result<(), SimulationError> {
    let mut base = scenario_for_sweep(&args, 0.0)?;

    // Scale every bond return toward 1.0 to emulate a low-yield regime.
    for (i, position) in base.portfolio.iter().enumerate() {
        if position.asset == "us_bonds" {
            let mut adjusted = (*base.values[i]).clone();
            for point in &mut adjusted.points {
                point.value -= (point.value - 1.0) * yield_adjust;
            }
            base.values[i] = std::sync::Arc::new(adjusted);
            break;
        }
    }

    let rates = withdrawal_rate_grid(3.0, 6.0, 0.1);
    match format {
        Format::Sheet => print_rate_header("Portfolio", &rates),
        Format::Graph => print_graph_x(&rates),
    }

    run_allocation_variants(&base, 10.0, |scenario| {
        print_success_rates(portfolio_label(scenario), scenario, &rates)
    })
}

fn rebalance_study(args: PeriodArgs, format: Format) -> Result<(), SimulationError> {
    let base = scenario_from_period(&args, 0.0)?;
    let rates = withdrawal_rate_grid(3.0, 6.0, 0.1);

    match format {
        Format::Sheet => print_rate_header("Rebalance", &rates),
        Format::Graph => print_graph_x(&rates),
    }

    let started = Instant::now();
    for rebalance in [Rebalancing::None, Rebalancing::Monthly, Rebalancing::Yearly] {
        let mut scenario = base.clone();
        scenario.rebalance = rebalance;
        print_success_rates(rebalance.as_str(), &scenario, &rates)?;
    }

    if format == Format::Sheet {
        throughput_line(started);
    }
    Ok(())
}

fn threshold_rebalance(args: PeriodArgs, format: Format) -> Result<(), SimulationError> {
    let base = scenario_from_period(&args, 0.0)?;
    let rates = withdrawal_rate_grid(3.0, 6.0, 0.1);

    match format {
        Format::Sheet => print_rate_header("Threshold", &rates),
        Format::Graph => print_graph_x(&rates),
    }

    for threshold in [0.01_f32, 0.02, 0.05, 0.10, 0.25, 0.50] {
        let mut scenario = base.clone();
        scenario.rebalance = Rebalancing::Threshold;
        scenario.rebalance_threshold = threshold;
        print_success_rates(threshold, &scenario, &rates)?;
    }
    Ok(())
}

fn current_wr(args: PeriodArgs, minimum: f32, format: Format) -> Result<(), SimulationError> {
    let mut base = scenario_from_period(&args, 0.0)?;
    base.withdraw_method = WithdrawalMethod::Current;
    base.minimum = minimum;

    let rates = withdrawal_rate_grid(3.0, 6.0, 0.25);
    match format {
        Format::Sheet => print_rate_header("Current WR", &rates),
        Format::Graph => print_graph_x(&rates),
    }

    let swept = sweep_withdrawal_rates(&base, &rates);
    for (_, results) in &swept {
        fail_on_error(results)?;
    }

    print_row("success", swept.iter().map(|(_, r)| format!("{:.2}", r.success_rate)));
    print_row("spending_avg", swept.iter().map(|(_, r)| format!("{:.1}", r.spending_average)));
    print_row("spending_min", swept.iter().map(|(_, r)| format!("{:.1}", r.spending_minimum)));
    Ok(())
}

const COVERAGE_GRID: [f32; 11] = [0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0];

fn social(args: FixedArgs, delay: usize, format: Format) -> Result<(), SimulationError> {
    let base = scenario_from_fixed(&args)?;

    match format {
        Format::Sheet => {
            print_row("Coverage", COVERAGE_GRID.iter().map(|c| format!("{c:.1}")))
        }
        Format::Graph => print_row("x", COVERAGE_GRID.iter().map(|c| format!("{c:.1}"))),
    }

    let mut success = Vec::with_capacity(COVERAGE_GRID.len());
    for coverage in COVERAGE_GRID {
        let mut scenario = base.clone();
        scenario.social_security = true;
        scenario.social_delay = delay;
        scenario.social_coverage = coverage;
        let results = simulate(&scenario);
        fail_on_error(&results)?;
        success.push(format!("{:.2}", results.success_rate));
    }

    print_row(format!("{}% delay {delay}y", args.wr), success);
    Ok(())
}

fn social_pf(args: FixedArgs, delay: usize, format: Format) -> Result<(), SimulationError> {
    let mut base = scenario_from_fixed(&args)?;
    if base.portfolio.len() != 2 {
        return Err(SimulationError::Configuration(
            "the social-security allocation study requires two assets".to_string(),
        ));
    }

    match format {
        Format::Sheet => {
            print_row("Portfolio", COVERAGE_GRID.iter().map(|c| format!("{c:.1}")))
        }
        Format::Graph => print_row("x", COVERAGE_GRID.iter().map(|c| format!("{c:.1}"))),
    }

    base.social_security = true;
    base.social_delay = delay;

    let mut stocks = 0.0_f32;
    while stocks <= 100.0 {
        base.portfolio[0].allocation = stocks;
        base.portfolio[1].allocation = 100.0 - stocks;

        let mut success = Vec::with_capacity(COVERAGE_GRID.len());
        for coverage in COVERAGE_GRID {
            let mut scenario = base.clone();
            scenario.social_coverage = coverage;
            let results = simulate(&scenario);
            fail_on_error(&results)?;
            success.push(format!("{:.2}", results.success_rate));
        }
        print_row(portfolio_label(&base), success);

        stocks += 25.0;
    }
    Ok(())
}

fn income_graph(args: PeriodArgs) -> Result<(), SimulationError> {
    let scenario = scenario_from_period(&args, 0.0)?;
    let rates = withdrawal_rate_grid(2.0, 6.0, 0.25);

    print_graph_x(&rates);
    let swept = sweep_withdrawal_rates(&scenario, &rates);
    for (_, results) in &swept {
        fail_on_error(results)?;
    }

    print_row("withdrawn_per_year", swept.iter().map(|(_, r)| format!("{:.1}", r.withdrawn_per_year)));
    print_row("spending_median", swept.iter().map(|(_, r)| format!("{:.1}", r.spending_median)));
    print_row("success", swept.iter().map(|(_, r)| format!("{:.2}", r.success_rate)));
    Ok(())
}

fn parse_flexibility(model: &str) -> Result<Flexibility, SimulationError> {
    match model {
        "none" => Ok(Flexibility::None),
        "portfolio" => Ok(Flexibility::Portfolio),
        "market" => Ok(Flexibility::Market),
        other => Err(SimulationError::Configuration(format!(
            "invalid flexibility model \"{other}\""
        ))),
    }
}

fn flexibility_graph(
    args: PeriodArgs,
    model: &str,
    first: (f32, f32),
    second: (f32, f32),
) -> Result<(), SimulationError> {
    let mut base = scenario_from_period(&args, 0.0)?;
    let rates = withdrawal_rate_grid(3.0, 6.0, 0.1);

    print_graph_x(&rates);
    print_success_rates("rigid", &base, &rates)?;

    base.flexibility = parse_flexibility(model)?;
    base.flexibility_threshold_1 = first.0;
    base.flexibility_change_1 = first.1;
    base.flexibility_threshold_2 = second.0;
    base.flexibility_change_2 = second.1;

    let swept = sweep_withdrawal_rates(&base, &rates);
    for (_, results) in &swept {
        fail_on_error(results)?;
    }
    print_row(
        format!("{model} {}/{} {}/{}", first.0, first.1, second.0, second.1),
        swept.iter().map(|(_, r)| format!("{:.2}", r.success_rate)),
    );
    print_row(
        "flexible_successes",
        swept.iter().map(|(_, r)| r.flexible_successes),
    );
    Ok(())
}

fn flexibility_auto_graph(args: PeriodArgs, model: &str) -> Result<(), SimulationError> {
    let mut base = scenario_from_period(&args, 0.0)?;
    base.flexibility = parse_flexibility(model)?;

    let rates = withdrawal_rate_grid(3.0, 6.0, 0.1);
    print_graph_x(&rates);

    for (threshold_1, change_1, threshold_2, change_2) in [
        (0.9_f32, 0.95_f32, 0.8_f32, 0.9_f32),
        (0.9, 0.9, 0.8, 0.8),
        (0.8, 0.9, 0.6, 0.8),
        (0.8, 0.8, 0.6, 0.6),
    ] {
        let mut scenario = base.clone();
        scenario.flexibility_threshold_1 = threshold_1;
        scenario.flexibility_change_1 = change_1;
        scenario.flexibility_threshold_2 = threshold_2;
        scenario.flexibility_change_2 = change_2;

        let swept = sweep_withdrawal_rates(&scenario, &rates);
        for (_, results) in &swept {
            fail_on_error(results)?;
        }
        print_row(
            format!("{threshold_1}/{change_1} {threshold_2}/{change_2}"),
            swept.iter().map(|(_, r)| format!("{:.2}", r.success_rate)),
        );
    }
    Ok(())
}

fn selection_graph(args: PeriodArgs) -> Result<(), SimulationError> {
    let base = scenario_from_period(&args, 0.0)?;
    let rates = withdrawal_rate_grid(3.0, 6.0, 0.1);

    print_graph_x(&rates);
    for (label, selection) in [
        ("allocation", WithdrawalSelection::Allocation),
        ("stocks_first", WithdrawalSelection::StocksFirst),
        ("bonds_first", WithdrawalSelection::BondsFirst),
    ] {
        let mut scenario = base.clone();
        scenario.selection = selection;
        print_success_rates(label, &scenario, &rates)?;
    }
    Ok(())
}

fn trinity_cash(
    args: FixedArgs,
    cash_method: &str,
    months_of_cash: usize,
    format: Format,
) -> Result<(), SimulationError> {
    let mut base = scenario_from_fixed(&args)?;
    base.cash_method = CashMethod::parse(cash_method)?;

    let monthly_withdrawal = base.initial_value * args.wr / 100.0 / 12.0;
    let months: Vec<usize> = (0..=months_of_cash).collect();

    match format {
        Format::Sheet => print_row("Months of cash", months.iter()),
        Format::Graph => print_row("x", months.iter()),
    }

    let mut success = Vec::with_capacity(months.len());
    let mut tv = Vec::with_capacity(months.len());
    for month in &months {
        let mut scenario = base.clone();
        scenario.initial_cash = *month as f32 * monthly_withdrawal;
        let results = simulate(&scenario);
        fail_on_error(&results)?;
        success.push(format!("{:.2}", results.success_rate));
        tv.push(format!("{:.0}", results.tv_average));
    }

    print_row(format!("{cash_method} success"), success);
    print_row(format!("{cash_method} avg tv"), tv);
    Ok(())
}

fn times_graph(args: PeriodArgs) -> Result<(), SimulationError> {
    let durations: Vec<usize> = (10..=50).step_by(10).collect();
    let overall = Instant::now();

    print_row("x", durations.iter());
    let mut times = Vec::with_capacity(durations.len());
    for years in &durations {
        let mut scenario = scenario_from_period(&args, 4.0)?;
        scenario.years = *years;

        let started = Instant::now();
        let results = simulate(&scenario);
        fail_on_error(&results)?;
        times.push(format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0));
    }
    print_row("milliseconds", times);
    throughput_line(overall);
    Ok(())
}
