//! Shared fixtures: in-memory store, mock gateways, and a dispatcher
//! wired for fast retries.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use taskbridge_core::forge::{
    ForgeGateway, ForgeIssue, IssueComment, IssuePatch, IssueQuery, NewIssue,
};
use taskbridge_core::gateway::GatewayError;
use taskbridge_core::model::{IssueState, SheetRecordRef, SheetTableRef, TableRegistryEntry};
use taskbridge_core::sheet::{
    JsonMap, MessageTarget, RecordQuery, SheetFieldDef, SheetGateway, SheetRecord, SheetTableInfo,
};
use taskbridge_daemon::dispatch::{Dispatcher, DispatcherConfig};
use taskbridge_daemon::intent::{Intents, NewMemberRequest};
use taskbridge_daemon::resolver::IdentityResolver;
use taskbridge_daemon::store::Store;

pub const REPO: &str = "acme/widgets";
pub const MAX_ATTEMPTS: u32 = 5;

/// In-memory forge double with programmable creation failures.
#[derive(Default)]
pub struct MockForge {
    issues: Mutex<BTreeMap<u64, ForgeIssue>>,
    next_number: AtomicU64,
    creates: AtomicU64,
    create_failures: Mutex<Vec<GatewayError>>,
    comments: Mutex<Vec<(u64, String)>>,
}

impl MockForge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an error for the next create call; drained front-first.
    pub fn fail_next_create(&self, err: GatewayError) {
        self.create_failures.lock().unwrap().push(err);
    }

    pub fn issue(&self, number: u64) -> Option<ForgeIssue> {
        self.issues.lock().unwrap().get(&number).cloned()
    }

    pub fn issue_count(&self) -> usize {
        self.issues.lock().unwrap().len()
    }

    /// Successful create calls so far.
    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    /// Seeds an issue as if it had been created out of band.
    pub fn seed_issue(&self, title: &str, body: &str, updated_at: DateTime<Utc>) -> u64 {
        let number = self.next_number.fetch_add(1, Ordering::SeqCst) + 1;
        self.issues.lock().unwrap().insert(
            number,
            ForgeIssue {
                number,
                title: title.to_owned(),
                body: body.to_owned(),
                state: IssueState::Open,
                state_reason: None,
                labels: Vec::new(),
                assignees: Vec::new(),
                created_at: updated_at,
                updated_at,
            },
        );
        number
    }

    /// Rewrites an issue in place, as a remote edit would.
    pub fn edit_issue(&self, number: u64, edit: impl FnOnce(&mut ForgeIssue)) {
        let mut issues = self.issues.lock().unwrap();
        let issue = issues.get_mut(&number).expect("issue exists");
        edit(issue);
    }
}

#[async_trait]
impl ForgeGateway for MockForge {
    fn repo(&self) -> &str {
        REPO
    }

    async fn create_issue(&self, issue: &NewIssue) -> Result<ForgeIssue, GatewayError> {
        if let Some(err) = {
            let mut failures = self.create_failures.lock().unwrap();
            if failures.is_empty() {
                None
            } else {
                Some(failures.remove(0))
            }
        } {
            return Err(err);
        }

        let number = self.next_number.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let created = ForgeIssue {
            number,
            title: issue.title.clone(),
            body: issue.body.clone(),
            state: IssueState::Open,
            state_reason: None,
            labels: issue.labels.clone(),
            assignees: issue.assignees.clone(),
            created_at: now,
            updated_at: now,
        };
        self.issues.lock().unwrap().insert(number, created.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn get_issue(&self, number: u64) -> Result<ForgeIssue, GatewayError> {
        self.issue(number)
            .ok_or_else(|| GatewayError::NotFound(format!("issue #{number}")))
    }

    async fn update_issue(
        &self,
        number: u64,
        patch: &IssuePatch,
    ) -> Result<ForgeIssue, GatewayError> {
        let mut issues = self.issues.lock().unwrap();
        let issue = issues
            .get_mut(&number)
            .ok_or_else(|| GatewayError::NotFound(format!("issue #{number}")))?;
        if let Some(title) = &patch.title {
            issue.title.clone_from(title);
        }
        if let Some(body) = &patch.body {
            issue.body.clone_from(body);
        }
        if let Some(state) = patch.state {
            issue.state = state;
        }
        if patch.state.is_some() {
            issue.state_reason = patch.state_reason;
        }
        if let Some(labels) = &patch.labels {
            issue.labels.clone_from(labels);
        }
        if let Some(assignees) = &patch.assignees {
            issue.assignees.clone_from(assignees);
        }
        issue.updated_at = Utc::now();
        Ok(issue.clone())
    }

    async fn list_issues(&self, query: &IssueQuery) -> Result<Vec<ForgeIssue>, GatewayError> {
        let issues = self.issues.lock().unwrap();
        Ok(issues
            .values()
            .filter(|issue| query.since.is_none_or(|since| issue.updated_at >= since))
            .cloned()
            .collect())
    }

    async fn add_comment(&self, number: u64, body: &str) -> Result<u64, GatewayError> {
        let mut comments = self.comments.lock().unwrap();
        comments.push((number, body.to_owned()));
        Ok(comments.len() as u64)
    }

    async fn list_comments(&self, number: u64) -> Result<Vec<IssueComment>, GatewayError> {
        Ok(self
            .comments
            .lock()
            .unwrap()
            .iter()
            .filter(|(issue, _)| *issue == number)
            .enumerate()
            .map(|(index, (_, body))| IssueComment {
                id: index as u64 + 1,
                author: "mock".to_owned(),
                body: body.clone(),
                created_at: Utc::now(),
            })
            .collect())
    }
}

/// In-memory sheet double.
#[derive(Default)]
pub struct MockSheet {
    records: Mutex<Vec<(SheetTableRef, SheetRecord)>>,
    next_record: AtomicU64,
    creates: AtomicU64,
    create_failures: Mutex<Vec<GatewayError>>,
    contacts: Mutex<HashMap<String, String>>,
    messages: Mutex<Vec<(String, String)>>,
}

impl MockSheet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_contact(&self, email: &str, open_id: &str) {
        self.contacts
            .lock()
            .unwrap()
            .insert(email.to_owned(), open_id.to_owned());
    }

    pub fn fail_next_create(&self, err: GatewayError) {
        self.create_failures.lock().unwrap().push(err);
    }

    pub fn record(&self, record_id: &str) -> Option<SheetRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|(_, record)| record.record_id == record_id)
            .map(|(_, record)| record.clone())
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    /// Messages delivered so far, as `(receive_id, text)` pairs.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }

    /// Rewrites a record in place, as a remote user edit would.
    pub fn edit_record(&self, record_id: &str, edit: impl FnOnce(&mut SheetRecord)) {
        let mut records = self.records.lock().unwrap();
        let (_, record) = records
            .iter_mut()
            .find(|(_, record)| record.record_id == record_id)
            .expect("record exists");
        edit(record);
    }
}

#[async_trait]
impl SheetGateway for MockSheet {
    async fn create_record(
        &self,
        table: &SheetTableRef,
        fields: &JsonMap,
    ) -> Result<String, GatewayError> {
        if let Some(err) = {
            let mut failures = self.create_failures.lock().unwrap();
            if failures.is_empty() {
                None
            } else {
                Some(failures.remove(0))
            }
        } {
            return Err(err);
        }

        let record_id = format!("rec{}", self.next_record.fetch_add(1, Ordering::SeqCst) + 1);
        self.records.lock().unwrap().push((
            table.clone(),
            SheetRecord {
                record_id: record_id.clone(),
                fields: fields.clone(),
                last_modified: Some(Utc::now()),
            },
        ));
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(record_id)
    }

    async fn get_record(&self, record: &SheetRecordRef) -> Result<SheetRecord, GatewayError> {
        self.record(&record.record_id)
            .ok_or_else(|| GatewayError::NotFound(format!("record {}", record.record_id)))
    }

    async fn update_record(
        &self,
        record: &SheetRecordRef,
        fields: &JsonMap,
    ) -> Result<(), GatewayError> {
        let mut records = self.records.lock().unwrap();
        let (_, stored) = records
            .iter_mut()
            .find(|(_, stored)| stored.record_id == record.record_id)
            .ok_or_else(|| GatewayError::NotFound(format!("record {}", record.record_id)))?;
        for (key, value) in fields {
            stored.fields.insert(key.clone(), value.clone());
        }
        stored.last_modified = Some(Utc::now());
        Ok(())
    }

    async fn search_records(
        &self,
        table: &SheetTableRef,
        query: &RecordQuery,
    ) -> Result<Vec<SheetRecord>, GatewayError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|(stored_table, record)| {
                stored_table == table
                    && query.modified_since.as_ref().is_none_or(|(_, since)| {
                        record.last_modified.is_none_or(|modified| modified >= *since)
                    })
            })
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn lookup_open_id(&self, email: &str) -> Result<Option<String>, GatewayError> {
        Ok(self.contacts.lock().unwrap().get(email).cloned())
    }

    async fn send_text(&self, target: &MessageTarget, text: &str) -> Result<(), GatewayError> {
        self.messages
            .lock()
            .unwrap()
            .push((target.receive_id().to_owned(), text.to_owned()));
        Ok(())
    }

    async fn list_tables(&self, _app_token: &str) -> Result<Vec<SheetTableInfo>, GatewayError> {
        Ok(Vec::new())
    }

    async fn create_table(
        &self,
        _app_token: &str,
        name: &str,
        _fields: &[SheetFieldDef],
    ) -> Result<String, GatewayError> {
        Ok(format!("tbl_{name}"))
    }
}

/// Everything a flow test needs, wired together.
pub struct TestEnv {
    pub store: Store,
    pub forge: Arc<MockForge>,
    pub sheet: Arc<MockSheet>,
    pub dispatcher: Arc<Dispatcher>,
    pub intents: Intents,
}

impl TestEnv {
    pub fn new() -> Self {
        let store = Store::in_memory().expect("in-memory store");
        let forge = Arc::new(MockForge::new());
        let sheet = Arc::new(MockSheet::new());
        let resolver = Arc::new(IdentityResolver::new(store.clone(), sheet.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            forge.clone(),
            sheet.clone(),
            resolver,
            DispatcherConfig {
                batch_size: 16,
                tick: Duration::from_millis(5),
                reclaim_after: Duration::from_secs(120),
                backoff_base: Duration::from_millis(1),
                backoff_cap: Duration::from_millis(4),
                max_attempts: MAX_ATTEMPTS,
                notify_chat_id: Some("oc_ops".to_owned()),
            },
        ));
        let intents = Intents::new(store.clone(), MAX_ATTEMPTS);
        Self {
            store,
            forge,
            sheet,
            dispatcher,
            intents,
        }
    }

    /// Registers the default test table and returns its reference.
    pub fn register_default_table(&self) -> SheetTableRef {
        let table = SheetTableRef::new("bas1", "tbl1");
        let mut entry = TableRegistryEntry::new(table.clone(), "Tasks");
        entry.is_default = true;
        self.intents.register_table(entry).expect("register table");
        table
    }

    /// Adds the stock test member with both external identities
    /// resolvable.
    pub fn add_member(&self) -> String {
        self.sheet.add_contact("a@co.example", "ou_A");
        self.intents
            .create_member(NewMemberRequest {
                name: "Ada".to_owned(),
                email: "a@co.example".to_owned(),
                forge_username: Some("a-gh".to_owned()),
                ..NewMemberRequest::default()
            })
            .expect("create member")
    }

    /// Drains the outbox, sleeping through short backoff windows, until
    /// nothing is open or the attempt budget runs out.
    pub async fn drain_through_backoff(&self) {
        for _ in 0..20 {
            self.dispatcher.drain().await.expect("drain");
            let open = self
                .store
                .read(taskbridge_daemon::store::outbox::open_count)
                .expect("count");
            if open == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
