//! Outbound push interface towards the index.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::acl::{Acl, DocId};
use crate::error::{SharePointError, SharePointResult};
use crate::groups::GroupDefinitions;

/// A document id with crawl hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub doc_id: DocId,
    /// Ask the index to fetch the document ahead of its normal schedule.
    pub crawl_immediately: bool,
}

impl Record {
    pub fn new(doc_id: DocId) -> Self {
        Self {
            doc_id,
            crawl_immediately: false,
        }
    }

    #[must_use]
    pub fn crawl_immediately(mut self) -> Self {
        self.crawl_immediately = true;
        self
    }
}

/// What a push was carrying, for error handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    DocIds,
    Records,
    NamedResources,
    GroupDefinitions,
}

/// Decides whether a failed push is retried.
pub trait PushErrorHandler: Send + Sync {
    /// `attempt` starts at 1. Returning true retries the same batch.
    fn handle_failure(&self, kind: PushKind, error: &SharePointError, attempt: u32) -> bool;
}

/// Retries transient failures a fixed number of times.
#[derive(Debug, Clone, Copy)]
pub struct RetryTransient {
    pub max_attempts: u32,
}

impl Default for RetryTransient {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl PushErrorHandler for RetryTransient {
    fn handle_failure(&self, kind: PushKind, error: &SharePointError, attempt: u32) -> bool {
        let retry = error.is_transient() && attempt < self.max_attempts;
        warn!(kind = ?kind, attempt, retry, error = %error, "Push failed");
        retry
    }
}

/// Sink for document ids, ACLs and group definitions.
///
/// Implementors provide the `_with` variants; the plain operations pass no
/// handler.
#[async_trait]
pub trait DocIdPusher: Send + Sync {
    async fn push_records_with(
        &self,
        records: Vec<Record>,
        handler: Option<&dyn PushErrorHandler>,
    ) -> SharePointResult<()>;

    async fn push_named_resources_with(
        &self,
        resources: HashMap<DocId, Acl>,
        handler: Option<&dyn PushErrorHandler>,
    ) -> SharePointResult<()>;

    async fn push_group_definitions_with(
        &self,
        definitions: GroupDefinitions,
        case_sensitive: bool,
        handler: Option<&dyn PushErrorHandler>,
    ) -> SharePointResult<()>;

    async fn push_doc_ids_with(
        &self,
        doc_ids: Vec<DocId>,
        handler: Option<&dyn PushErrorHandler>,
    ) -> SharePointResult<()> {
        let records = doc_ids.into_iter().map(Record::new).collect();
        self.push_records_with(records, handler).await
    }

    async fn push_doc_ids(&self, doc_ids: Vec<DocId>) -> SharePointResult<()> {
        self.push_doc_ids_with(doc_ids, None).await
    }

    async fn push_records(&self, records: Vec<Record>) -> SharePointResult<()> {
        self.push_records_with(records, None).await
    }

    async fn push_named_resources(&self, resources: HashMap<DocId, Acl>) -> SharePointResult<()> {
        self.push_named_resources_with(resources, None).await
    }

    async fn push_group_definitions(
        &self,
        definitions: GroupDefinitions,
        case_sensitive: bool,
    ) -> SharePointResult<()> {
        self.push_group_definitions_with(definitions, case_sensitive, None)
            .await
    }
}

/// Supplies a default error handler to a pusher that has none.
pub struct WithErrorHandler<P> {
    inner: P,
    handler: Arc<dyn PushErrorHandler>,
}

impl<P: DocIdPusher> WithErrorHandler<P> {
    pub fn new(inner: P, handler: Arc<dyn PushErrorHandler>) -> Self {
        Self { inner, handler }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    fn pick<'a>(&'a self, handler: Option<&'a dyn PushErrorHandler>) -> &'a dyn PushErrorHandler {
        handler.unwrap_or(self.handler.as_ref())
    }
}

#[async_trait]
impl<P: DocIdPusher> DocIdPusher for WithErrorHandler<P> {
    async fn push_records_with(
        &self,
        records: Vec<Record>,
        handler: Option<&dyn PushErrorHandler>,
    ) -> SharePointResult<()> {
        self.inner
            .push_records_with(records, Some(self.pick(handler)))
            .await
    }

    async fn push_named_resources_with(
        &self,
        resources: HashMap<DocId, Acl>,
        handler: Option<&dyn PushErrorHandler>,
    ) -> SharePointResult<()> {
        self.inner
            .push_named_resources_with(resources, Some(self.pick(handler)))
            .await
    }

    async fn push_group_definitions_with(
        &self,
        definitions: GroupDefinitions,
        case_sensitive: bool,
        handler: Option<&dyn PushErrorHandler>,
    ) -> SharePointResult<()> {
        self.inner
            .push_group_definitions_with(definitions, case_sensitive, Some(self.pick(handler)))
            .await
    }
}

#[async_trait]
impl<P: DocIdPusher + ?Sized> DocIdPusher for Arc<P> {
    async fn push_records_with(
        &self,
        records: Vec<Record>,
        handler: Option<&dyn PushErrorHandler>,
    ) -> SharePointResult<()> {
        (**self).push_records_with(records, handler).await
    }

    async fn push_named_resources_with(
        &self,
        resources: HashMap<DocId, Acl>,
        handler: Option<&dyn PushErrorHandler>,
    ) -> SharePointResult<()> {
        (**self).push_named_resources_with(resources, handler).await
    }

    async fn push_group_definitions_with(
        &self,
        definitions: GroupDefinitions,
        case_sensitive: bool,
        handler: Option<&dyn PushErrorHandler>,
    ) -> SharePointResult<()> {
        (**self)
            .push_group_definitions_with(definitions, case_sensitive, handler)
            .await
    }
}

/// Everything a [`RecordingPusher`] received.
#[derive(Debug, Clone, Default)]
pub struct PushLog {
    pub records: Vec<Record>,
    pub named_resources: Vec<(DocId, Acl)>,
    pub group_definitions: Vec<GroupDefinitions>,
}

/// In-memory pusher that keeps every push, for dry runs and tests.
///
/// Failures can be injected; each injected failure consumes one push attempt
/// and is run through the error handler like a real transport failure.
#[derive(Debug, Default)]
pub struct RecordingPusher {
    log: Mutex<PushLog>,
    failures: Mutex<Vec<SharePointError>>,
}

impl RecordingPusher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next push attempts fail with the given errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = SharePointError>) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.extend(errors);
        }
    }

    pub fn snapshot(&self) -> PushLog {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn pushed_doc_ids(&self) -> Vec<DocId> {
        self.snapshot()
            .records
            .into_iter()
            .map(|record| record.doc_id)
            .collect()
    }

    fn attempt(&self, kind: PushKind, handler: Option<&dyn PushErrorHandler>) -> SharePointResult<()> {
        let mut attempt = 1;
        loop {
            let failure = self
                .failures
                .lock()
                .ok()
                .and_then(|mut f| (!f.is_empty()).then(|| f.remove(0)));
            let Some(error) = failure else {
                return Ok(());
            };
            let retry = handler.is_some_and(|h| h.handle_failure(kind, &error, attempt));
            if !retry {
                return Err(error);
            }
            attempt += 1;
        }
    }

    fn record(&self, f: impl FnOnce(&mut PushLog)) {
        if let Ok(mut log) = self.log.lock() {
            f(&mut log);
        }
    }
}

#[async_trait]
impl DocIdPusher for RecordingPusher {
    async fn push_records_with(
        &self,
        records: Vec<Record>,
        handler: Option<&dyn PushErrorHandler>,
    ) -> SharePointResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.attempt(PushKind::Records, handler)?;
        self.record(|log| log.records.extend(records));
        Ok(())
    }

    async fn push_named_resources_with(
        &self,
        resources: HashMap<DocId, Acl>,
        handler: Option<&dyn PushErrorHandler>,
    ) -> SharePointResult<()> {
        if resources.is_empty() {
            return Ok(());
        }
        self.attempt(PushKind::NamedResources, handler)?;
        self.record(|log| log.named_resources.extend(resources));
        Ok(())
    }

    async fn push_group_definitions_with(
        &self,
        definitions: GroupDefinitions,
        _case_sensitive: bool,
        handler: Option<&dyn PushErrorHandler>,
    ) -> SharePointResult<()> {
        if definitions.is_empty() {
            return Ok(());
        }
        self.attempt(PushKind::GroupDefinitions, handler)?;
        self.record(|log| log.group_definitions.push(definitions));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_doc_ids_become_plain_records() {
        let pusher = RecordingPusher::new();
        pusher
            .push_doc_ids(vec![DocId::new("http://sp/a"), DocId::new("http://sp/b")])
            .await
            .unwrap();
        let log = pusher.snapshot();
        assert_eq!(log.records.len(), 2);
        assert!(log.records.iter().all(|r| !r.crawl_immediately));
    }

    #[tokio::test]
    async fn test_default_handler_retries_transient_failures() {
        let pusher = WithErrorHandler::new(RecordingPusher::new(), Arc::new(RetryTransient::default()));
        pusher
            .inner()
            .fail_next([SharePointError::Transport("reset".into())]);
        pusher
            .push_records(vec![Record::new(DocId::new("http://sp/a")).crawl_immediately()])
            .await
            .unwrap();
        let log = pusher.inner().snapshot();
        assert_eq!(log.records.len(), 1);
        assert!(log.records[0].crawl_immediately);
    }

    #[tokio::test]
    async fn test_without_handler_failures_propagate() {
        let pusher = RecordingPusher::new();
        pusher.fail_next([SharePointError::Transport("reset".into())]);
        let err = pusher.push_doc_ids(vec![DocId::new("http://sp/a")]).await;
        assert!(err.is_err());
        assert!(pusher.snapshot().records.is_empty());
    }

    #[tokio::test]
    async fn test_explicit_handler_wins_over_default() {
        struct Never;
        impl PushErrorHandler for Never {
            fn handle_failure(&self, _: PushKind, _: &SharePointError, _: u32) -> bool {
                false
            }
        }
        let pusher = WithErrorHandler::new(RecordingPusher::new(), Arc::new(RetryTransient::default()));
        pusher
            .inner()
            .fail_next([SharePointError::Transport("reset".into())]);
        let result = pusher
            .push_records_with(vec![Record::new(DocId::new("http://sp/a"))], Some(&Never))
            .await;
        assert!(result.is_err());
    }
}
