//! Historical series store: CSV loading, caching, and the transforms that
//! turn raw monthly price levels into the normalized returns the kernel
//! consumes.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use serde::Serialize;

use super::error::SimulationError;
use super::portfolio::AssetAllocation;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DataPoint {
    pub year: u16,
    pub month: u16,
    pub value: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSeries {
    pub name: String,
    pub points: Vec<DataPoint>,
}

impl DataSeries {
    pub fn first(&self) -> &DataPoint {
        &self.points[0]
    }

    pub fn last(&self) -> &DataPoint {
        &self.points[self.points.len() - 1]
    }

    pub fn start_year(&self) -> u16 {
        self.first().year
    }

    pub fn end_year(&self) -> u16 {
        self.last().year
    }

    /// Index of the point for `(year, month)`, computed arithmetically from
    /// the first point. The series is dense, one point per calendar month.
    pub fn index_of(&self, year: u16, month: u16) -> Option<usize> {
        let front = self.first();
        let months_from_front =
            (year as i64 - front.year as i64) * 12 + (month as i64 - front.month as i64);
        if months_from_front < 0 || months_from_front >= self.points.len() as i64 {
            return None;
        }
        Some(months_from_front as usize)
    }

    pub fn is_start_valid(&self, year: u16, month: u16) -> bool {
        self.index_of(year, month).is_some()
    }

    pub fn value_at(&self, index: usize) -> f32 {
        self.points[index].value
    }

    /// Trim partial years at both ends, then rescale so the first kept value
    /// is 1.0 while the ratio between consecutive months is preserved.
    pub fn normalize(&mut self) {
        while self
            .points
            .last()
            .is_some_and(|point| point.month != 12)
        {
            self.points.pop();
        }

        let leading = self
            .points
            .iter()
            .position(|point| point.month == 1)
            .unwrap_or(self.points.len());
        self.points.drain(..leading);

        if self.points.is_empty() || self.points[0].value == 1.0 {
            return;
        }

        let mut previous = self.points[0].value;
        self.points[0].value = 1.0;
        for i in 1..self.points.len() {
            let raw = self.points[i].value;
            self.points[i].value = self.points[i - 1].value * (raw / previous);
            previous = raw;
        }
    }

    /// Replace each value after index 0 by the month-over-month ratio. The
    /// first value stays 1.0 and acts as the neutral first multiplier.
    pub fn to_returns(&mut self) {
        let mut previous = self.points[0].value;
        for i in 1..self.points.len() {
            let level = self.points[i].value;
            self.points[i].value = level / previous;
            previous = level;
        }
    }

    /// Reciprocal of every value, for inverting an exchange-rate series.
    /// Applies to price levels, before normalization and `to_returns`.
    pub fn invert(&mut self) {
        for point in &mut self.points {
            point.value = 1.0 / point.value;
        }
    }
}

static SERIES_CACHE: Lazy<Mutex<HashMap<String, Arc<DataSeries>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Load `stock-data/{name}.csv`, with a process-wide cache keyed by name.
/// The cached copy is the raw file; callers normalize their own clone.
pub fn load_data(name: &str) -> Result<DataSeries, SimulationError> {
    {
        let cache = SERIES_CACHE.lock().expect("series cache poisoned");
        if let Some(series) = cache.get(name) {
            return Ok((**series).clone());
        }
    }

    let path = format!("stock-data/{name}.csv");
    let file = std::fs::File::open(&path).map_err(|e| {
        log::warn!("failed to open {path}: {e}");
        SimulationError::MissingData(path.clone())
    })?;

    let series = load_data_from_reader(name, file)?;

    let mut cache = SERIES_CACHE.lock().expect("series cache poisoned");
    cache
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(series.clone()));

    Ok(series)
}

/// Parse `month,year,value` rows. Values may be quoted and contain embedded
/// thousands separators, which are stripped before parsing.
pub fn load_data_from_reader<R: Read>(
    name: &str,
    reader: R,
) -> Result<DataSeries, SimulationError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut points = Vec::new();
    for record in csv_reader.records() {
        let record =
            record.map_err(|e| SimulationError::MissingData(format!("{name}: {e}")))?;
        if record.len() < 3 {
            return Err(SimulationError::MissingData(format!(
                "{name}: expected month,year,value but got {} fields",
                record.len()
            )));
        }

        let month = record[0]
            .trim()
            .parse::<u16>()
            .map_err(|e| SimulationError::MissingData(format!("{name}: bad month: {e}")))?;
        let year = record[1]
            .trim()
            .parse::<u16>()
            .map_err(|e| SimulationError::MissingData(format!("{name}: bad year: {e}")))?;
        let value = record[2]
            .trim()
            .replace(',', "")
            .parse::<f32>()
            .map_err(|e| SimulationError::MissingData(format!("{name}: bad value: {e}")))?;

        points.push(DataPoint { year, month, value });
    }

    if points.is_empty() {
        return Err(SimulationError::MissingData(format!("{name}: empty series")));
    }

    Ok(DataSeries {
        name: name.to_string(),
        points,
    })
}

/// Load the returns series for every asset of a portfolio. An `_x2` suffix
/// fabricates a doubled-length history: the returns are duplicated and the
/// copy is back-dated month by month before the original start.
pub fn load_portfolio_series(
    portfolio: &[AssetAllocation],
) -> Result<Vec<Arc<DataSeries>>, SimulationError> {
    let mut values = Vec::with_capacity(portfolio.len());

    for position in portfolio {
        let doubled = position.asset.ends_with("_x2");
        let base_name = if doubled {
            &position.asset[..position.asset.len() - 3]
        } else {
            position.asset.as_str()
        };

        let mut series = load_data(base_name)?;
        series.normalize();
        if series.points.is_empty() {
            return Err(SimulationError::MissingData(format!(
                "{base_name}: no full calendar year of data"
            )));
        }
        series.to_returns();

        if doubled {
            double_history(&mut series);
            series.name = position.asset.clone();
        }

        values.push(Arc::new(series));
    }

    Ok(values)
}

fn double_history(series: &mut DataSeries) {
    let copy = series.points.clone();
    series.points.extend_from_slice(&copy);

    // The first half keeps its return values but is re-dated to end one
    // month before the untouched second half starts.
    for i in 0..copy.len() {
        let j = copy.len() - 1 - i;
        let next = series.points[j + 1];
        let current = &mut series.points[j];
        if next.month == 1 {
            current.month = 12;
            current.year = next.year - 1;
        } else {
            current.month = next.month - 1;
            current.year = next.year;
        }
    }
}

/// Load an inflation series as monthly returns. The sentinel `no_inflation`
/// clones the first asset series with every value forced to the neutral 1.0.
pub fn load_inflation(
    values: &[Arc<DataSeries>],
    name: &str,
) -> Result<Arc<DataSeries>, SimulationError> {
    if name == "no_inflation" {
        let first = values.first().ok_or_else(|| {
            SimulationError::Configuration("cannot build a neutral inflation without assets".into())
        })?;
        let mut series = (**first).clone();
        series.name = "no_inflation".to_string();
        for point in &mut series.points {
            point.value = 1.0;
        }
        return Ok(Arc::new(series));
    }

    let mut series = load_data(name)?;
    series.normalize();
    if series.points.is_empty() {
        return Err(SimulationError::MissingData(format!(
            "{name}: no full calendar year of data"
        )));
    }
    series.to_returns();
    Ok(Arc::new(series))
}

/// Load an exchange-rate series as monthly returns, optionally inverted for
/// the reciprocal currency pair.
pub fn load_exchange(name: &str, inverted: bool) -> Result<Arc<DataSeries>, SimulationError> {
    let mut series = load_data(name)?;
    if inverted {
        series.invert();
    }
    series.normalize();
    if series.points.is_empty() {
        return Err(SimulationError::MissingData(format!(
            "{name}: no full calendar year of data"
        )));
    }
    series.to_returns();
    Ok(Arc::new(series))
}

#[cfg(test)]
pub(crate) fn series_from_values(name: &str, start_year: u16, values: &[f32]) -> DataSeries {
    let points = values
        .iter()
        .enumerate()
        .map(|(i, &value)| DataPoint {
            year: start_year + (i / 12) as u16,
            month: (i % 12) as u16 + 1,
            value,
        })
        .collect();

    DataSeries {
        name: name.to_string(),
        points,
    }
}

/// A flat returns series (every month 1.0) covering full calendar years,
/// shared by kernel and engine tests.
#[cfg(test)]
pub(crate) fn constant_returns(name: &str, start_year: u16, end_year: u16, value: f32) -> DataSeries {
    let months = (end_year - start_year + 1) as usize * 12;
    let mut series = series_from_values(name, start_year, &vec![value; months]);
    series.points[0].value = 1.0;
    series
}
