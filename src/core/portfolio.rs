use serde::Serialize;

use super::error::SimulationError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetAllocation {
    pub asset: String,
    pub allocation: f32,
}

/// Parse `"asset1:p1;asset2:p2;…"` into a portfolio. A zero-sum portfolio is
/// rejected unless `allow_zero_sum` is set (sweep commands use the zero-sum
/// form to mean "iterate over allocations").
pub fn parse_portfolio(
    input: &str,
    allow_zero_sum: bool,
) -> Result<Vec<AssetAllocation>, SimulationError> {
    let mut portfolio = Vec::new();

    for position in input.split(';') {
        let position = position.trim();
        if position.is_empty() {
            continue;
        }

        let (asset, allocation) = position.split_once(':').ok_or_else(|| {
            SimulationError::Configuration(format!(
                "invalid portfolio position \"{position}\", expected asset:percent"
            ))
        })?;

        let allocation = allocation.trim().parse::<f32>().map_err(|_| {
            SimulationError::Configuration(format!(
                "invalid allocation \"{allocation}\" for asset {asset}"
            ))
        })?;

        portfolio.push(AssetAllocation {
            asset: asset.trim().to_string(),
            allocation,
        });
    }

    if portfolio.is_empty() {
        return Err(SimulationError::Configuration(
            "the portfolio cannot be empty".to_string(),
        ));
    }

    if !allow_zero_sum && total_allocation(&portfolio) == 0.0 {
        return Err(SimulationError::Configuration(
            "the portfolio allocation cannot be zero".to_string(),
        ));
    }

    Ok(portfolio)
}

/// Scale allocations so they sum to 100. A zero-sum portfolio is left alone.
pub fn normalize_portfolio(portfolio: &mut [AssetAllocation]) {
    let total = total_allocation(portfolio);

    if total != 100.0 && total > 0.0 {
        for position in portfolio.iter_mut() {
            position.allocation *= 100.0 / total;
        }
    }
}

pub fn total_allocation(portfolio: &[AssetAllocation]) -> f32 {
    portfolio.iter().map(|position| position.allocation).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_asset_portfolio() {
        let portfolio = parse_portfolio("us_stocks:60;us_bonds:40;", false).expect("must parse");
        assert_eq!(portfolio.len(), 2);
        assert_eq!(portfolio[0].asset, "us_stocks");
        assert_eq!(portfolio[0].allocation, 60.0);
        assert_eq!(portfolio[1].asset, "us_bonds");
        assert_eq!(portfolio[1].allocation, 40.0);
    }

    #[test]
    fn parses_without_trailing_separator() {
        let portfolio = parse_portfolio("gold:100", false).expect("must parse");
        assert_eq!(portfolio.len(), 1);
        assert_eq!(portfolio[0].asset, "gold");
    }

    #[test]
    fn parses_fractional_allocations() {
        let portfolio = parse_portfolio("us_stocks:33.3;us_bonds:66.7;", false).expect("must parse");
        assert!((portfolio[0].allocation - 33.3).abs() < 1e-5);
    }

    #[test]
    fn rejects_missing_colon() {
        assert!(parse_portfolio("us_stocks60;", false).is_err());
    }

    #[test]
    fn rejects_empty_string() {
        assert!(parse_portfolio("", false).is_err());
    }

    #[test]
    fn rejects_zero_sum_unless_allowed() {
        assert!(parse_portfolio("us_stocks:0;us_bonds:0;", false).is_err());
        let portfolio = parse_portfolio("us_stocks:0;us_bonds:0;", true).expect("must parse");
        assert_eq!(total_allocation(&portfolio), 0.0);
    }

    #[test]
    fn normalize_scales_to_one_hundred() {
        let mut portfolio = parse_portfolio("us_stocks:40;us_bonds:40;", false).expect("must parse");
        normalize_portfolio(&mut portfolio);
        assert!((total_allocation(&portfolio) - 100.0).abs() < 1e-4);
        assert!((portfolio[0].allocation - 50.0).abs() < 1e-4);
    }

    #[test]
    fn normalize_keeps_exact_portfolio_untouched() {
        let mut portfolio = parse_portfolio("us_stocks:60;us_bonds:40;", false).expect("must parse");
        normalize_portfolio(&mut portfolio);
        assert_eq!(portfolio[0].allocation, 60.0);
        assert_eq!(portfolio[1].allocation, 40.0);
    }

    #[test]
    fn normalize_leaves_zero_sum_alone() {
        let mut portfolio = parse_portfolio("us_stocks:0;us_bonds:0;", true).expect("must parse");
        normalize_portfolio(&mut portfolio);
        assert_eq!(total_allocation(&portfolio), 0.0);
    }
}
