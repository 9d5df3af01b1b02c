// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The metric value type shared by every pipeline stage.
//!
//! A [`Metric`] is owned by exactly one stage at a time and handed over through channels.
//! When a metric carries delivery tickets (see [`crate::tracking`]), every holder finishes with
//! exactly one [`Disposition`]. Cloning is the copy operation: the clone shares the tickets of
//! the original and counts as one more holder.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::tracking::DeliveryTicket;

/// Convenience for building metrics without tags.
pub const NO_TAGS: [(&str, &str); 0] = [];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueType {
    #[default]
    Untyped,
    Counter,
    Gauge,
    Summary,
    Histogram,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    UInt(u64),
    Bool(bool),
    String(String),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::UInt(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Int(v) => write!(f, "{v}i"),
            FieldValue::UInt(v) => write!(f, "{v}u"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::String(v) => write!(f, "\"{}\"", v.replace('"', "\\\"")),
        }
    }
}

/// Terminal outcome a holder reports for its reference to a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delivered successfully.
    Accept,
    /// Delivery failed; the producer learns the metric was not delivered.
    Reject,
    /// The holder is done without an opinion on delivery (filtered, aggregated, ...).
    Drop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub key: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone)]
pub struct Metric {
    name: String,
    tags: Vec<Tag>,
    fields: Vec<Field>,
    time: SystemTime,
    value_type: ValueType,
    tickets: Vec<DeliveryTicket>,
}

impl Metric {
    /// Builds a metric. Duplicate keys keep the last value at the position of the first
    /// occurrence.
    pub fn new<N, K, V, F>(
        name: N,
        tags: impl IntoIterator<Item = (K, V)>,
        fields: impl IntoIterator<Item = (F, FieldValue)>,
        time: SystemTime,
        value_type: ValueType,
    ) -> Self
    where
        N: Into<String>,
        K: Into<String>,
        V: Into<String>,
        F: Into<String>,
    {
        let mut metric = Metric {
            name: name.into(),
            tags: Vec::new(),
            fields: Vec::new(),
            time,
            value_type,
            tickets: Vec::new(),
        };
        for (k, v) in tags {
            metric.add_tag(k, v);
        }
        for (k, v) in fields {
            metric.add_field(k, v);
        }
        metric
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn add_prefix(&mut self, prefix: &str) {
        self.name.insert_str(0, prefix);
    }

    pub fn add_suffix(&mut self, suffix: &str) {
        self.name.push_str(suffix);
    }

    #[must_use]
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    #[must_use]
    pub fn get_tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }

    #[must_use]
    pub fn has_tag(&self, key: &str) -> bool {
        self.tags.iter().any(|t| t.key == key)
    }

    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.tags.iter_mut().find(|t| t.key == key) {
            Some(tag) => tag.value = value,
            None => self.tags.push(Tag { key, value }),
        }
    }

    pub fn remove_tag(&mut self, key: &str) -> Option<String> {
        let idx = self.tags.iter().position(|t| t.key == key)?;
        Some(self.tags.remove(idx).value)
    }

    pub(crate) fn retain_tags(&mut self, keep: impl FnMut(&Tag) -> bool) {
        self.tags.retain(keep);
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    #[must_use]
    pub fn get_field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.key == key).map(|f| &f.value)
    }

    #[must_use]
    pub fn has_field(&self, key: &str) -> bool {
        self.fields.iter().any(|f| f.key == key)
    }

    pub fn add_field(&mut self, key: impl Into<String>, value: FieldValue) {
        let key = key.into();
        match self.fields.iter_mut().find(|f| f.key == key) {
            Some(field) => field.value = value,
            None => self.fields.push(Field { key, value }),
        }
    }

    pub fn remove_field(&mut self, key: &str) -> Option<FieldValue> {
        let idx = self.fields.iter().position(|f| f.key == key)?;
        Some(self.fields.remove(idx).value)
    }

    pub(crate) fn retain_fields(&mut self, keep: impl FnMut(&Field) -> bool) {
        self.fields.retain(keep);
    }

    #[must_use]
    pub fn time(&self) -> SystemTime {
        self.time
    }

    pub fn set_time(&mut self, time: SystemTime) {
        self.time = time;
    }

    #[must_use]
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// A metric without fields carries no data and must not be forwarded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[must_use]
    pub fn is_tracked(&self) -> bool {
        !self.tickets.is_empty()
    }

    /// Deep copy that does not take part in delivery tracking.
    #[must_use]
    pub fn copy_untracked(&self) -> Metric {
        Metric {
            name: self.name.clone(),
            tags: self.tags.clone(),
            fields: self.fields.clone(),
            time: self.time,
            value_type: self.value_type,
            tickets: Vec::new(),
        }
    }

    pub(crate) fn attach(&mut self, ticket: DeliveryTicket) {
        self.tickets.push(ticket);
    }

    pub fn settle(mut self, disposition: Disposition) {
        for ticket in self.tickets.drain(..) {
            ticket.settle(disposition);
        }
    }

    pub fn accept(self) {
        self.settle(Disposition::Accept);
    }

    pub fn reject(self) {
        self.settle(Disposition::Reject);
    }

    /// The `Drop` disposition. Letting the metric go out of scope has the same effect.
    pub fn discard(self) {
        self.settle(Disposition::Drop);
    }
}

impl PartialEq for Metric {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.tags == other.tags
            && self.fields == other.fields
            && self.time == other.time
            && self.value_type == other.value_type
    }
}

fn escape_key(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

/// Line protocol rendering: `name,tag=v field=1i 1700000000000000000`.
impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name.replace(',', "\\,").replace(' ', "\\ "))?;
        for tag in &self.tags {
            write!(f, ",{}={}", escape_key(&tag.key), escape_key(&tag.value))?;
        }
        for (i, field) in self.fields.iter().enumerate() {
            let sep = if i == 0 { ' ' } else { ',' };
            write!(f, "{sep}{}={}", escape_key(&field.key), field.value)?;
        }
        let nanos = self
            .time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        write!(f, " {nanos}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cpu() -> Metric {
        Metric::new(
            "cpu",
            [("host", "a"), ("cpu", "cpu0")],
            [("usage", FieldValue::Float(12.5)), ("count", FieldValue::Int(3))],
            UNIX_EPOCH + Duration::from_secs(10),
            ValueType::Gauge,
        )
    }

    #[test]
    fn test_tags_keep_insertion_order_and_replace_in_place() {
        let mut m = cpu();
        m.add_tag("region", "eu");
        m.add_tag("host", "b");
        let keys: Vec<&str> = m.tags().iter().map(|t| t.key.as_str()).collect();
        assert_eq!(keys, vec!["host", "cpu", "region"]);
        assert_eq!(m.get_tag("host"), Some("b"));
        assert_eq!(m.remove_tag("cpu"), Some("cpu0".to_string()));
        assert!(!m.has_tag("cpu"));
    }

    #[test]
    fn test_empty_after_removing_all_fields() {
        let mut m = cpu();
        assert!(!m.is_empty());
        m.remove_field("usage");
        m.remove_field("count");
        assert!(m.is_empty());
    }

    #[test]
    fn test_name_mutations() {
        let mut m = cpu();
        m.add_prefix("sys_");
        m.add_suffix("_total");
        assert_eq!(m.name(), "sys_cpu_total");
        m.set_name("load");
        assert_eq!(m.name(), "load");
    }

    #[test]
    fn test_display_line_protocol() {
        let m = Metric::new(
            "disk usage",
            [("path", "/var lib")],
            [
                ("free", FieldValue::UInt(7)),
                ("mode", FieldValue::from("rw")),
            ],
            UNIX_EPOCH + Duration::from_secs(1),
            ValueType::Untyped,
        );
        assert_eq!(
            m.to_string(),
            "disk\\ usage,path=/var\\ lib free=7u,mode=\"rw\" 1000000000"
        );
    }
}
