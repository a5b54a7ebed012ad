//! Scripted store used by the unit tests.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::LockStore;

#[derive(Clone, Copy, Debug)]
pub enum Reply {
    Value(i64),
    NotFound,
    DeadlineExceeded,
    Other(&'static str),
    Hang,
    Panic,
}

#[derive(Debug, Default)]
struct Script {
    queue: VecDeque<Reply>,
    fallback: Option<Reply>,
    calls: usize,
}

impl Script {
    fn next(&mut self) -> Reply {
        self.calls += 1;
        self.queue
            .pop_front()
            .or(self.fallback)
            .unwrap_or(Reply::Other("no scripted reply"))
    }
}

#[derive(Debug, Default)]
struct State {
    set_if_absent: Script,
    acquire: Script,
    extend: Script,
    delete: Script,
    acquire_tokens: Vec<String>,
    last_lease_millis: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct ScriptedStore {
    state: Arc<Mutex<State>>,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_set_if_absent(&self, reply: Reply) {
        self.state.lock().unwrap().set_if_absent.queue.push_back(reply);
    }

    pub fn push_acquire(&self, reply: Reply) {
        self.state.lock().unwrap().acquire.queue.push_back(reply);
    }

    pub fn always_acquire(&self, reply: Reply) {
        self.state.lock().unwrap().acquire.fallback = Some(reply);
    }

    pub fn push_extend(&self, reply: Reply) {
        self.state.lock().unwrap().extend.queue.push_back(reply);
    }

    pub fn always_extend(&self, reply: Reply) {
        self.state.lock().unwrap().extend.fallback = Some(reply);
    }

    pub fn push_delete(&self, reply: Reply) {
        self.state.lock().unwrap().delete.queue.push_back(reply);
    }

    pub fn set_if_absent_calls(&self) -> usize {
        self.state.lock().unwrap().set_if_absent.calls
    }

    pub fn acquire_calls(&self) -> usize {
        self.state.lock().unwrap().acquire.calls
    }

    pub fn acquire_tokens(&self) -> Vec<String> {
        self.state.lock().unwrap().acquire_tokens.clone()
    }

    pub fn extend_calls(&self) -> usize {
        self.state.lock().unwrap().extend.calls
    }

    pub fn last_lease_millis(&self) -> Option<u64> {
        self.state.lock().unwrap().last_lease_millis
    }
}

async fn answer(reply: Reply) -> Result<i64, StoreError> {
    match reply {
        Reply::Value(value) => Ok(value),
        Reply::NotFound => Err(StoreError::NotFound),
        Reply::DeadlineExceeded => Err(StoreError::DeadlineExceeded),
        Reply::Other(message) => Err(StoreError::other(io::Error::other(message))),
        Reply::Hang => std::future::pending().await,
        Reply::Panic => panic!("scripted store panic"),
    }
}

#[async_trait]
impl LockStore for ScriptedStore {
    async fn set_if_absent(
        &self,
        _key: &str,
        _token: &str,
        _lease: Duration,
    ) -> Result<bool, StoreError> {
        let reply = self.state.lock().unwrap().set_if_absent.next();
        answer(reply).await.map(|value| value != 0)
    }

    async fn acquire(&self, _key: &str, token: &str, _lease: Duration) -> Result<bool, StoreError> {
        let reply = {
            let mut state = self.state.lock().unwrap();
            state.acquire_tokens.push(token.to_string());
            state.acquire.next()
        };
        answer(reply).await.map(|value| value != 0)
    }

    async fn compare_and_extend(
        &self,
        _key: &str,
        _token: &str,
        lease_millis: u64,
    ) -> Result<i64, StoreError> {
        let reply = {
            let mut state = self.state.lock().unwrap();
            state.last_lease_millis = Some(lease_millis);
            state.extend.next()
        };
        answer(reply).await
    }

    async fn compare_and_delete(&self, _key: &str, _token: &str) -> Result<i64, StoreError> {
        let reply = self.state.lock().unwrap().delete.next();
        answer(reply).await
    }
}
