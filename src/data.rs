use ndarray::{concatenate, Array2, ArrayView1, Axis};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{check_same_len, CoreError, Result};
use crate::types::Info;

/// Info key holding the block's name ("approach", "retract", ...).
pub const NAME_KEY: &str = "name";

/// Samples x named channels, plus metadata.
///
/// Rows are sample indices. Column names carry a unit suffix in parentheses,
/// e.g. `"z piezo (m)"`. Operations add (or replace) derived columns; raw
/// columns are never rewritten in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataBlock {
    columns: Vec<String>,
    data: Array2<f64>,
    #[serde(default)]
    info: Info,
}

impl DataBlock {
    pub fn new(columns: Vec<String>, data: Array2<f64>) -> Result<Self> {
        check_same_len(columns.len(), data.ncols())?;
        Ok(Self {
            columns,
            data,
            info: Info::new(),
        })
    }

    /// Builds a block from `(name, samples)` pairs of equal length.
    pub fn from_columns<S: Into<String>>(pairs: Vec<(S, Vec<f64>)>) -> Result<Self> {
        let rows = pairs.first().map(|(_, v)| v.len()).unwrap_or(0);
        let mut columns = Vec::with_capacity(pairs.len());
        let mut data = Array2::zeros((rows, pairs.len()));
        for (j, (name, values)) in pairs.into_iter().enumerate() {
            check_same_len(rows, values.len())?;
            data.column_mut(j).assign(&ArrayView1::from(values.as_slice()));
            columns.push(name.into());
        }
        Ok(Self {
            columns,
            data,
            info: Info::new(),
        })
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.info
            .insert(NAME_KEY.to_string(), Value::String(name.to_string()));
        self
    }

    pub fn with_info(mut self, key: &str, value: Value) -> Self {
        self.info.insert(key.to_string(), value);
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.info.get(NAME_KEY).and_then(Value::as_str)
    }

    /// Number of samples (rows).
    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn info(&self) -> &Info {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut Info {
        &mut self.info
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| CoreError::MissingColumn {
                column: name.to_string(),
                available: self.columns.clone(),
            })
    }

    pub fn column(&self, name: &str) -> Result<ArrayView1<'_, f64>> {
        let j = self.column_index(name)?;
        Ok(self.data.column(j))
    }

    pub fn column_vec(&self, name: &str) -> Result<Vec<f64>> {
        Ok(self.column(name)?.to_vec())
    }

    /// Replaces the column if it exists, otherwise appends it.
    pub fn set_column(&mut self, name: &str, values: &[f64]) -> Result<()> {
        if !self.columns.is_empty() {
            check_same_len(self.len(), values.len())?;
        }
        let values = ArrayView1::from(values);
        if let Some(j) = self.columns.iter().position(|c| c == name) {
            self.data.column_mut(j).assign(&values);
            return Ok(());
        }
        let new_col = values.insert_axis(Axis(1));
        self.data = if self.columns.is_empty() {
            new_col.to_owned()
        } else {
            concatenate(Axis(1), &[self.data.view(), new_col]).map_err(|_| {
                CoreError::LengthMismatch {
                    expected: self.data.nrows(),
                    actual: new_col.nrows(),
                }
            })?
        };
        self.columns.push(name.to_string());
        Ok(())
    }

    /// Numeric metadata lookup; absent or non-numeric keys are a missing-input error.
    pub fn info_f64(&self, key: &str) -> Result<f64> {
        self.info
            .get(key)
            .and_then(Value::as_f64)
            .ok_or_else(|| CoreError::MissingInfo {
                key: key.to_string(),
            })
    }

    /// Stores a structured result under `key`, replacing any previous value.
    pub fn set_info_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        self.info
            .insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn info_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self.info.get(key).ok_or_else(|| CoreError::MissingInfo {
            key: key.to_string(),
        })?;
        Ok(T::deserialize(value)?)
    }
}

/// Splits `"z piezo (m)"` into `("z piezo", Some("m"))`.
pub fn split_unit(column: &str) -> (&str, Option<&str>) {
    let trimmed = column.trim_end();
    if let (Some(open), true) = (trimmed.rfind('('), trimmed.ends_with(')')) {
        let name = trimmed[..open].trim_end();
        let unit = &trimmed[open + 1..trimmed.len() - 1];
        return (name, Some(unit));
    }
    (trimmed, None)
}

/// Fails unless `column` carries the `unit` suffix.
pub fn require_unit(column: &str, unit: &str) -> Result<()> {
    match split_unit(column) {
        (_, Some(u)) if u == unit => Ok(()),
        _ => Err(CoreError::UnitMismatch {
            column: column.to_string(),
            expected: unit.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> DataBlock {
        DataBlock::from_columns(vec![
            ("z piezo (m)", vec![0.0, 1.0, 2.0]),
            ("deflection (m)", vec![5.0, 4.0, 3.0]),
        ])
        .unwrap()
        .with_name("retract")
    }

    #[test]
    fn columns_are_found_by_name() {
        let b = block();
        assert_eq!(b.len(), 3);
        assert_eq!(b.name(), Some("retract"));
        assert_eq!(b.column_vec("deflection (m)").unwrap(), vec![5.0, 4.0, 3.0]);
        let err = b.column("deflection (N)").unwrap_err();
        assert!(matches!(err, CoreError::MissingColumn { ref column, .. } if column == "deflection (N)"));
    }

    #[test]
    fn set_column_appends_then_replaces() {
        let mut b = block();
        b.set_column("deflection (N)", &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(b.columns().len(), 3);
        b.set_column("deflection (N)", &[7.0, 8.0, 9.0]).unwrap();
        assert_eq!(b.columns().len(), 3);
        assert_eq!(b.column_vec("deflection (N)").unwrap(), vec![7.0, 8.0, 9.0]);
        assert_eq!(b.column_vec("z piezo (m)").unwrap(), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn set_column_rejects_wrong_length() {
        let mut b = block();
        let err = b.set_column("x (m)", &[1.0]).unwrap_err();
        assert!(matches!(err, CoreError::LengthMismatch { expected: 3, actual: 1 }));
    }

    #[test]
    fn unit_suffix_parsing() {
        assert_eq!(split_unit("z piezo (m)"), ("z piezo", Some("m")));
        assert_eq!(split_unit("deflection (N)"), ("deflection", Some("N")));
        assert_eq!(split_unit("index"), ("index", None));
        assert!(require_unit("surface distance (m)", "m").is_ok());
        assert!(require_unit("deflection (N)", "m").is_err());
    }

    #[test]
    fn info_lookup_requires_numbers() {
        let b = block().with_info("spring constant (N/m)", serde_json::json!(0.05));
        assert_eq!(b.info_f64("spring constant (N/m)").unwrap(), 0.05);
        assert!(matches!(
            b.info_f64("temperature (K)"),
            Err(CoreError::MissingInfo { .. })
        ));
    }

    #[test]
    fn structured_info_is_replaced_not_merged() {
        let mut b = block();
        b.set_info_json("peaks", &vec![1usize, 2, 3]).unwrap();
        b.set_info_json("peaks", &vec![4usize]).unwrap();
        assert_eq!(b.info_json::<Vec<usize>>("peaks").unwrap(), vec![4]);
        assert!(matches!(
            b.info_json::<Vec<usize>>("polymer fit"),
            Err(CoreError::MissingInfo { .. })
        ));
        assert!(matches!(
            b.info_json::<String>("peaks"),
            Err(CoreError::Serialization(_))
        ));
    }

    #[test]
    fn blocks_round_trip_through_json() {
        let b = block();
        let text = serde_json::to_string(&b).unwrap();
        let back: DataBlock = serde_json::from_str(&text).unwrap();
        assert_eq!(back, b);
    }
}
