use serde::{Deserialize, Serialize};

/// Transport wrapper holding one payload inside a buffer.
///
/// A record has no identity of its own beyond the payload it carries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    data: T,
}

impl<T> Record<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }
}

impl<T> From<T> for Record<T> {
    fn from(data: T) -> Self {
        Self::new(data)
    }
}
