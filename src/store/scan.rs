//! Cursor-chained range scans.
//!
//! A backend caps how many rows one sub-query returns. [`RangeScan`] hides that by fetching a
//! page at a time and, whenever a page comes back full, issuing the next sub-query from the
//! page's cursor. A short page ends the scan. Only one page is held in memory.

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashMap;

use super::backend::{Backend, Cursor, RangeQuery, StoreError};
use crate::measurement::StorableMeasurement;

pub struct RangeScan<'a> {
    backend: &'a dyn Backend,
    query: RangeQuery,
    page_limit: usize,
    buffered: std::vec::IntoIter<StorableMeasurement>,
    cursor: Option<Cursor>,
    exhausted: bool,
    pages: usize,
}

impl<'a> RangeScan<'a> {
    pub fn new(backend: &'a dyn Backend, query: RangeQuery) -> Self {
        let page_limit = backend.max_page_size();
        Self::resume(backend, query, page_limit, None)
    }

    /// Continue a scan from a cursor previously returned by [`RangeScan::cursor`].
    pub fn resume(
        backend: &'a dyn Backend,
        query: RangeQuery,
        page_limit: usize,
        cursor: Option<Cursor>,
    ) -> Self {
        Self {
            backend,
            query,
            page_limit: page_limit.clamp(1, backend.max_page_size().max(1)),
            buffered: Vec::new().into_iter(),
            cursor,
            exhausted: false,
            pages: 0,
        }
    }

    /// Position after the last page fetched so far. Records of that page not yet yielded are
    /// not covered by a resume from here.
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    /// Number of sub-queries issued so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    fn fetch_page(&mut self) -> Result<(), StoreError> {
        let page = self
            .backend
            .run(&self.query, self.cursor.as_ref(), self.page_limit)?;
        self.pages += 1;

        if page.records.len() < self.page_limit {
            // A further sub-query would come back empty.
            self.exhausted = true;
        }
        match page.cursor {
            Some(cursor) => self.cursor = Some(cursor),
            None => self.exhausted = true,
        }
        self.buffered = page.records.into_iter();
        Ok(())
    }
}

impl Iterator for RangeScan<'_> {
    type Item = Result<StorableMeasurement, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(m) = self.buffered.next() {
                return Some(Ok(m));
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}

/// Measurements grouped by device. Devices keep the order in which the scan first met them;
/// each device's measurements keep scan order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DeviceSeries {
    devices: Vec<(String, Vec<StorableMeasurement>)>,
    index: HashMap<String, usize>,
}

impl DeviceSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, m: StorableMeasurement) {
        match self.index.get(&m.device_id) {
            Some(&i) => self.devices[i].1.push(m),
            None => {
                self.index.insert(m.device_id.clone(), self.devices.len());
                self.devices.push((m.device_id.clone(), vec![m]));
            }
        }
    }

    /// Drain a scan, stopping at the first error.
    pub fn collect<I>(records: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = Result<StorableMeasurement, StoreError>>,
    {
        let mut series = Self::new();
        for m in records {
            series.push(m?);
        }
        Ok(series)
    }

    pub fn get(&self, device_id: &str) -> Option<&[StorableMeasurement]> {
        self.index
            .get(device_id)
            .map(|&i| self.devices[i].1.as_slice())
    }

    pub fn device_ids(&self) -> impl Iterator<Item = &str> {
        self.devices.iter().map(|(id, _)| id.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[StorableMeasurement])> {
        self.devices
            .iter()
            .map(|(id, records)| (id.as_str(), records.as_slice()))
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Number of measurements across all devices.
    pub fn total(&self) -> usize {
        self.devices.iter().map(|(_, records)| records.len()).sum()
    }
}

impl Serialize for DeviceSeries {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.devices.len()))?;
        for (id, records) in &self.devices {
            map.serialize_entry(id, records)?;
        }
        map.end()
    }
}
