//! Query parameters of one tracking request

use std::collections::BTreeMap;
use std::fmt;

use crate::dispatch::{encode_query, Event};

/// Well-known collection API parameter names.
pub mod params {
    pub const SITE_ID: &str = "idsite";
    pub const RECORD: &str = "rec";
    pub const API_VERSION: &str = "apiv";
    pub const VISITOR_ID: &str = "_id";
    pub const USER_ID: &str = "uid";
    pub const DATETIME_OF_REQUEST: &str = "cdt";
    pub const SEND_IMAGE: &str = "send_image";
    pub const URL_PATH: &str = "url";
    pub const ACTION_NAME: &str = "action_name";
    pub const SESSION_START: &str = "new_visit";
    pub const FIRST_VISIT_TIMESTAMP: &str = "_idts";
    pub const TOTAL_NUMBER_OF_VISITS: &str = "_idvc";
    pub const PREVIOUS_VISIT_TIMESTAMP: &str = "_viewts";
    pub const EVENT_CATEGORY: &str = "e_c";
    pub const EVENT_ACTION: &str = "e_a";
    pub const EVENT_NAME: &str = "e_n";
    pub const EVENT_VALUE: &str = "e_v";
}

/// Ordered parameter map for a tracking request.
///
/// Empty values are never stored, so a parameter is either meaningful or
/// absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackMe {
    params: BTreeMap<String, String>,
}

impl TrackMe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, replacing any previous value. Empty values are ignored.
    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        let value = value.to_string();
        if !value.is_empty() {
            self.params.insert(key.into(), value);
        }
        self
    }

    /// Builder-style [`TrackMe::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    /// Set `key` only if it has no value yet.
    pub fn try_set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        if !self.has(key) {
            self.set(key, value);
        }
        self
    }

    /// Like [`TrackMe::try_set`], skipping `None`.
    pub fn try_set_opt(&mut self, key: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value {
            self.try_set(key, value);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn has(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.params.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Encoded query string, `?k=v&...`.
    pub fn to_query(&self) -> String {
        encode_query(&self.params)
    }

    /// Freeze into a queued event stamped with the current time.
    pub fn to_event(&self) -> Event {
        Event::from_params(&self.params)
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for TrackMe {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut track_me = TrackMe::new();
        for (key, value) in iter {
            track_me.set(key, value);
        }
        track_me
    }
}

impl fmt::Display for TrackMe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query())
    }
}
