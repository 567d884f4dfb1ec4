use lumen_events::AssetId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use super::request::LoadRequest;
use crate::error::LoadError;
use crate::host::ScriptAsset;
use crate::requests::RetrieveBytecodeRequest;
use crate::signal::WorkSignal;

pub type FetchResult = Result<Option<ScriptAsset>, LoadError>;

/// Producer side of the load pipeline. Shares the scheduler's work signal so
/// a single driver wait covers both.
pub struct LoaderInbox {
    requests: Mutex<VecDeque<LoadRequest>>,
    fetched: Mutex<Vec<(AssetId, FetchResult)>>,
    bytecode_requests: Mutex<VecDeque<RetrieveBytecodeRequest>>,
    signal: Arc<WorkSignal>,
}

impl LoaderInbox {
    pub fn new(signal: Arc<WorkSignal>) -> Self {
        Self {
            requests: Mutex::new(VecDeque::new()),
            fetched: Mutex::new(Vec::new()),
            bytecode_requests: Mutex::new(VecDeque::new()),
            signal,
        }
    }

    /// Newest requests are served first
    pub fn push_request(&self, request: LoadRequest) {
        self.requests.lock().push_front(request);
        self.signal.notify();
    }

    pub fn push_bytecode_request(&self, request: RetrieveBytecodeRequest) {
        self.bytecode_requests.lock().push_back(request);
        self.signal.notify();
    }

    /// Completion of an asynchronous asset fetch
    pub fn push_fetched(&self, asset_id: AssetId, result: FetchResult) {
        self.fetched.lock().push((asset_id, result));
        self.signal.notify();
    }

    pub(crate) fn pop_request(&self) -> Option<LoadRequest> {
        self.requests.lock().pop_front()
    }

    pub(crate) fn take_bytecode_requests(&self) -> VecDeque<RetrieveBytecodeRequest> {
        std::mem::take(&mut *self.bytecode_requests.lock())
    }

    pub(crate) fn take_fetched(&self) -> Vec<(AssetId, FetchResult)> {
        std::mem::take(&mut *self.fetched.lock())
    }

    pub fn has_pending(&self) -> bool {
        !self.requests.lock().is_empty()
            || !self.fetched.lock().is_empty()
            || !self.bytecode_requests.lock().is_empty()
    }
}
