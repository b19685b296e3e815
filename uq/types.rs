use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

/// Metric values gathered over an epoch, keyed by metric name.
#[repr(transparent)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricLog(pub HashMap<String, f64>);

impl MetricLog {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn record(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// Sorted metric names, for diagnostics.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.0.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Deref for MetricLog {
    type Target = HashMap<String, f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for MetricLog {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<HashMap<String, f64>> for MetricLog {
    fn from(values: HashMap<String, f64>) -> Self {
        Self(values)
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for MetricLog {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Append-only record of an adaptive parameter, one entry per epoch.
#[repr(transparent)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct History(Vec<f64>);

impl History {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, value: f64) {
        self.0.push(value);
    }

    pub fn last(&self) -> Option<f64> {
        self.0.last().copied()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

impl Deref for History {
    type Target = [f64];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<History> for Vec<f64> {
    fn from(values: History) -> Self {
        values.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_log_lookup_and_sorted_names() {
        let mut log: MetricLog = [("mse", 0.5), ("abstention", 0.1)].into_iter().collect();
        log.record("abstention_acc", 0.9);

        assert_eq!(log.value("mse"), Some(0.5));
        assert_eq!(log.value("missing"), None);
        assert_eq!(log.names(), vec!["abstention", "abstention_acc", "mse"]);
    }

    #[test]
    fn history_is_append_only() {
        let mut history = History::new();
        assert!(history.is_empty());
        history.push(1.0);
        history.push(0.95);
        assert_eq!(history.len(), 2);
        assert_eq!(history.last(), Some(0.95));
        assert_eq!(history.into_inner(), vec![1.0, 0.95]);
    }
}
