use serde::Serialize;

/// Presentation flags a component exposes next to its cache snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ViewState {
    /// A bulk fetch is in flight.
    pub loading: bool,
    /// Last fetch or write failure, if any.
    pub error: Option<String>,
    /// The change channel dropped; the cache may be behind the store.
    pub stale: bool,
}

impl ViewState {
    pub fn begin_load(&mut self) {
        self.loading = true;
    }

    pub fn load_succeeded(&mut self) {
        self.loading = false;
        self.error = None;
    }

    pub fn load_failed(&mut self, error: impl ToString) {
        self.loading = false;
        self.error = Some(error.to_string());
    }

    pub fn set_error(&mut self, error: impl ToString) {
        self.error = Some(error.to_string());
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn clear_stale(&mut self) {
        self.stale = false;
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none() && !self.stale
    }
}
