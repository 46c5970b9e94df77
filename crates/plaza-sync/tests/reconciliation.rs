//! End-to-end reconciliation: pulled snapshots from a fake REST collaborator
//! merged with events pushed through the in-memory channel.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::oneshot;
use uuid::Uuid;

use plaza_gateway::memory::{MemoryConnector, MemoryServer, MemoryServers};
use plaza_gateway::{ConnectionConfig, ConnectionState};
use plaza_sync::api::{
    CommentApi, CommunityApi, ConversationApi, Credentials, FeedApi, FollowApi, NotificationApi,
};
use plaza_sync::{ApiError, ApiResult, Apis, DeliveryStatus, Realtime, RealtimeConfig, SyncError};
use plaza_types::api::{FeedPage, FollowState, MembershipState, NotificationPage, VoteTally};
use plaza_types::events::{ChannelCommand, ChannelEvent};
use plaza_types::models::{
    Comment, CommunityMessage, Conversation, FeedItem, FeedPatch, Message, Notification, Session,
    Topic, UserRef, VoteDirection,
};

// -- Fake pull-side collaborator --

struct FakeApi {
    me: Uuid,
    feed: Mutex<Vec<FeedItem>>,
    older: Mutex<Vec<FeedItem>>,
    conversations: Mutex<Vec<Conversation>>,
    notifications: Mutex<Vec<Notification>>,
    fail_writes: AtomicBool,
    vote_gate: Mutex<Option<oneshot::Receiver<()>>>,
    send_gate: Mutex<Option<oneshot::Receiver<()>>>,
    older_gate: Mutex<Option<oneshot::Receiver<()>>>,
    messages_gate: Mutex<Option<oneshot::Receiver<()>>>,
    token: Mutex<String>,
    pulled_with: Mutex<Vec<String>>,
    last_sent: Mutex<Option<Message>>,
    read_calls: AtomicUsize,
}

impl FakeApi {
    fn new(me: Uuid) -> Self {
        Self {
            me,
            feed: Mutex::new(Vec::new()),
            older: Mutex::new(Vec::new()),
            conversations: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            vote_gate: Mutex::new(None),
            send_gate: Mutex::new(None),
            older_gate: Mutex::new(None),
            messages_gate: Mutex::new(None),
            token: Mutex::new(String::new()),
            pulled_with: Mutex::new(Vec::new()),
            last_sent: Mutex::new(None),
            read_calls: AtomicUsize::new(0),
        }
    }

    fn unavailable() -> ApiError {
        ApiError::Status {
            status: 503,
            body: "unavailable".into(),
        }
    }

    fn write_result(&self) -> ApiResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(Self::unavailable())
        } else {
            Ok(())
        }
    }

    fn gate_votes(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.vote_gate.lock() = Some(rx);
        tx
    }

    fn gate_sends(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.send_gate.lock() = Some(rx);
        tx
    }

    fn gate_older_pages(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.older_gate.lock() = Some(rx);
        tx
    }

    fn gate_messages(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.messages_gate.lock() = Some(rx);
        tx
    }
}

impl Credentials for FakeApi {
    fn set_session(&self, session: &Session) {
        *self.token.lock() = session.token.clone();
    }
}

async fn pass(gate: &Mutex<Option<oneshot::Receiver<()>>>) {
    let rx = gate.lock().take();
    if let Some(rx) = rx {
        let _ = rx.await;
    }
}

#[async_trait]
impl FeedApi for FakeApi {
    async fn list_feed(&self, page: u32, _limit: u32) -> ApiResult<FeedPage> {
        if page == 1 {
            return Ok(FeedPage {
                items: self.feed.lock().clone(),
                has_more: !self.older.lock().is_empty(),
            });
        }
        pass(&self.older_gate).await;
        let items = if page == 2 { self.older.lock().clone() } else { Vec::new() };
        Ok(FeedPage {
            items,
            has_more: false,
        })
    }

    async fn vote(&self, post_id: Uuid, direction: Option<VoteDirection>) -> ApiResult<VoteTally> {
        pass(&self.vote_gate).await;
        self.write_result()?;
        let mut tally = VoteTally {
            upvoters: BTreeSet::new(),
            downvoters: BTreeSet::new(),
        };
        match direction {
            Some(VoteDirection::Up) => tally.upvoters.insert(self.me),
            Some(VoteDirection::Down) => tally.downvoters.insert(self.me),
            None => false,
        };
        if let Some(item) = self.feed.lock().iter_mut().find(|i| i.id == post_id) {
            item.upvoters = tally.upvoters.clone();
            item.downvoters = tally.downvoters.clone();
        }
        Ok(tally)
    }
}

#[async_trait]
impl ConversationApi for FakeApi {
    async fn list_conversations(&self) -> ApiResult<Vec<Conversation>> {
        let token = self.token.lock().clone();
        self.pulled_with.lock().push(token);
        Ok(self.conversations.lock().clone())
    }

    async fn list_messages(
        &self,
        _conversation_id: Uuid,
        _before: Option<DateTime<Utc>>,
        _limit: u32,
    ) -> ApiResult<Vec<Message>> {
        pass(&self.messages_gate).await;
        Ok(Vec::new())
    }

    async fn send_message(
        &self,
        conversation_id: Uuid,
        content: &str,
        client_id: Uuid,
    ) -> ApiResult<Message> {
        let committed = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: self.me,
            receiver_id: Uuid::nil(),
            content: content.to_string(),
            created_at: Utc::now(),
            is_read: true,
            client_id: Some(client_id),
        };
        *self.last_sent.lock() = Some(committed.clone());
        pass(&self.send_gate).await;
        self.write_result()?;
        Ok(committed)
    }

    async fn mark_conversation_read(&self, _conversation_id: Uuid) -> ApiResult<()> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        self.write_result()
    }
}

#[async_trait]
impl NotificationApi for FakeApi {
    async fn list_notifications(&self) -> ApiResult<NotificationPage> {
        let items = self.notifications.lock().clone();
        let unread_count = items.iter().filter(|n| !n.is_read).count() as u32;
        Ok(NotificationPage {
            items,
            unread_count,
        })
    }

    async fn mark_notification_read(&self, _id: Uuid) -> ApiResult<()> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        self.write_result()
    }

    async fn mark_all_notifications_read(&self) -> ApiResult<()> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        self.write_result()
    }
}

#[async_trait]
impl FollowApi for FakeApi {
    async fn set_following(&self, user_id: Uuid, follow: bool) -> ApiResult<FollowState> {
        self.write_result()?;
        Ok(FollowState {
            user_id,
            following: follow,
            follower_count: 1,
        })
    }
}

#[async_trait]
impl CommunityApi for FakeApi {
    async fn set_membership(&self, community_id: Uuid, join: bool) -> ApiResult<MembershipState> {
        self.write_result()?;
        Ok(MembershipState {
            community_id,
            joined: join,
            member_count: 1,
        })
    }

    async fn list_community_messages(
        &self,
        _community_id: Uuid,
        _limit: u32,
    ) -> ApiResult<Vec<CommunityMessage>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl CommentApi for FakeApi {
    async fn list_comments(&self, _post_id: Uuid, _parent: Option<Uuid>) -> ApiResult<Vec<Comment>> {
        Ok(Vec::new())
    }
}

// -- Harness --

struct Harness {
    me: Uuid,
    peer: Uuid,
    api: Arc<FakeApi>,
    connector: Arc<MemoryConnector>,
    servers: MemoryServers,
    engine: Realtime,
}

fn harness() -> Harness {
    let (me, peer) = (Uuid::new_v4(), Uuid::new_v4());
    let api = Arc::new(FakeApi::new(me));
    let (connector, servers) = MemoryConnector::new(me);
    let connector = Arc::new(connector);

    let apis = Apis {
        credentials: api.clone(),
        feed: api.clone(),
        conversations: api.clone(),
        notifications: api.clone(),
        follows: api.clone(),
        communities: api.clone(),
        comments: api.clone(),
    };
    let config = RealtimeConfig {
        connection: ConnectionConfig {
            handshake_timeout: Duration::from_secs(2),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
        },
        ..RealtimeConfig::default()
    };
    let engine = Realtime::new(connector.clone(), apis, config);

    Harness {
        me,
        peer,
        api,
        connector,
        servers,
        engine,
    }
}

impl Harness {
    fn session(&self) -> Session {
        Session::new("token-1", self.me)
    }

    async fn connected(&mut self) -> MemoryServer {
        let server = self.servers.accept().await.expect("link opened");
        let mut state = self.engine.watch_state();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .expect("connected");
        server
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn user(id: Uuid) -> UserRef {
    UserRef {
        id,
        username: format!("user-{}", &id.to_string()[..8]),
    }
}

fn post(author: Uuid) -> FeedItem {
    let now = Utc::now();
    FeedItem {
        id: Uuid::new_v4(),
        author: user(author),
        content: "hello plaza".into(),
        upvoters: BTreeSet::new(),
        downvoters: BTreeSet::new(),
        comment_count: 0,
        share_count: 0,
        impression_count: 0,
        created_at: now,
        updated_at: now,
    }
}

fn conversation(me: Uuid, peer: Uuid, age_mins: i64) -> Conversation {
    Conversation {
        id: Uuid::new_v4(),
        participants: vec![me, peer],
        last_message: None,
        unread_count: 0,
        updated_at: Utc::now() - chrono::Duration::minutes(age_mins),
    }
}

fn message(conversation_id: Uuid, from: Uuid, to: Uuid) -> Message {
    Message {
        id: Uuid::new_v4(),
        conversation_id,
        sender_id: from,
        receiver_id: to,
        content: "ping".into(),
        created_at: Utc::now(),
        is_read: false,
        client_id: None,
    }
}

fn notification() -> Notification {
    Notification {
        id: Uuid::new_v4(),
        kind: "mention".into(),
        payload: json!({ "post": Uuid::new_v4() }),
        is_read: false,
        created_at: Utc::now(),
    }
}

// -- Properties --

#[tokio::test]
async fn same_id_from_pull_and_push_is_stored_once() {
    let mut h = harness();
    let pulled_post = post(h.peer);
    let pulled_notification = notification();
    let conv = conversation(h.me, h.peer, 5);
    h.api.feed.lock().push(pulled_post.clone());
    h.api.notifications.lock().push(pulled_notification.clone());
    h.api.conversations.lock().push(conv.clone());

    let sync = h.engine.start(h.session()).await;
    let server = h.connected().await;

    let msg = message(conv.id, h.peer, h.me);
    let sentinel = post(h.peer);
    server.push(ChannelEvent::PostNew(pulled_post.clone()));
    server.push(ChannelEvent::Notification(pulled_notification.clone()));
    server.push(ChannelEvent::Message(msg.clone()));
    server.push(ChannelEvent::Message(msg.clone()));
    server.push(ChannelEvent::PostNew(sentinel.clone()));

    eventually(|| sync.feed.get(sentinel.id).is_some()).await;

    assert_eq!(sync.feed.items().len(), 2);
    assert_eq!(sync.notifications.items().len(), 1);
    assert_eq!(sync.notifications.unread(), 1);
    assert_eq!(sync.conversations.messages(conv.id).len(), 1);
    assert_eq!(sync.conversations.unread(conv.id), 1);

    h.engine.stop().await;
}

#[tokio::test]
async fn messages_keep_order_and_move_conversation_to_head_once() {
    let mut h = harness();
    let older = conversation(h.me, h.peer, 30);
    let newer = conversation(h.me, Uuid::new_v4(), 1);
    h.api.conversations.lock().extend([older.clone(), newer.clone()]);

    let sync = h.engine.start(h.session()).await;
    assert_eq!(sync.conversations.conversations()[0].id, newer.id);
    let server = h.connected().await;

    let a = message(older.id, h.peer, h.me);
    let mut b = message(older.id, h.peer, h.me);
    b.created_at = a.created_at + chrono::Duration::seconds(1);
    server.push(ChannelEvent::Message(a.clone()));
    server.push(ChannelEvent::Message(b.clone()));

    eventually(|| sync.conversations.messages(older.id).len() == 2).await;

    let ids: Vec<Uuid> = sync.conversations.messages(older.id).iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![a.id, b.id]);

    let list = sync.conversations.conversations();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].id, older.id);
    assert_eq!(list[0].last_message.as_ref().map(|m| m.id), Some(b.id));

    h.engine.stop().await;
}

#[tokio::test]
async fn unread_counts_each_inbound_message_until_read() {
    let mut h = harness();
    let conv = conversation(h.me, h.peer, 5);
    h.api.conversations.lock().push(conv.clone());

    let sync = h.engine.start(h.session()).await;
    let server = h.connected().await;

    let mut seen = vec![sync.conversations.unread(conv.id)];
    for expected in 1..=5 {
        server.push(ChannelEvent::Message(message(conv.id, h.peer, h.me)));
        eventually(|| sync.conversations.unread(conv.id) == expected).await;
        seen.push(sync.conversations.unread(conv.id));
    }

    sync.conversations.mark_read(conv.id).await;
    seen.push(sync.conversations.unread(conv.id));

    assert_eq!(seen, vec![0, 1, 2, 3, 4, 5, 0]);
    assert!(sync.conversations.messages(conv.id).iter().all(|m| m.is_read));
    assert_eq!(h.api.read_calls.load(Ordering::SeqCst), 1);

    h.engine.stop().await;
}

#[tokio::test]
async fn failed_read_confirmation_is_not_rolled_back() {
    let mut h = harness();
    let conv = conversation(h.me, h.peer, 5);
    h.api.conversations.lock().push(conv.clone());

    let sync = h.engine.start(h.session()).await;
    let server = h.connected().await;
    server.push(ChannelEvent::Message(message(conv.id, h.peer, h.me)));
    eventually(|| sync.conversations.unread(conv.id) == 1).await;

    h.api.fail_writes.store(true, Ordering::SeqCst);
    sync.conversations.mark_read(conv.id).await;
    assert_eq!(sync.conversations.unread(conv.id), 0);

    h.engine.stop().await;
}

#[tokio::test]
async fn left_conversation_stays_unread_when_its_page_arrives_late() {
    let mut h = harness();
    let left = conversation(h.me, h.peer, 5);
    let current = conversation(h.me, Uuid::new_v4(), 10);
    h.api.conversations.lock().extend([left.clone(), current.clone()]);

    let sync = h.engine.start(h.session()).await;
    let server = h.connected().await;

    let release = h.api.gate_messages();
    let conversations = sync.conversations.clone();
    let left_id = left.id;
    let opening = tokio::spawn(async move { conversations.open(left_id).await });
    eventually(|| h.api.messages_gate.lock().is_none()).await;

    sync.conversations.open(current.id).await.expect("opened");
    for expected in 1..=3 {
        server.push(ChannelEvent::Message(message(left.id, h.peer, h.me)));
        eventually(|| sync.conversations.unread(left.id) == expected).await;
    }

    release.send(()).expect("page still pending");
    opening.await.expect("open task").expect("late open");

    assert_eq!(sync.conversations.active(), Some(current.id));
    assert_eq!(sync.conversations.unread(left.id), 3);
    assert!(sync.conversations.messages(left.id).iter().all(|m| !m.is_read));
    assert_eq!(h.api.read_calls.load(Ordering::SeqCst), 1);

    h.engine.stop().await;
}

#[tokio::test]
async fn failed_notification_reads_are_not_rolled_back() {
    let mut h = harness();
    let (first, second) = (notification(), notification());
    h.api.notifications.lock().extend([first.clone(), second.clone()]);

    let sync = h.engine.start(h.session()).await;
    let _server = h.connected().await;
    assert_eq!(sync.notifications.unread(), 2);

    h.api.fail_writes.store(true, Ordering::SeqCst);
    sync.notifications.mark_read(first.id).await;
    assert_eq!(sync.notifications.unread(), 1);
    assert!(
        sync.notifications
            .items()
            .iter()
            .any(|n| n.id == first.id && n.is_read)
    );

    sync.notifications.mark_all_read().await;
    assert_eq!(sync.notifications.unread(), 0);
    assert!(sync.notifications.items().iter().all(|n| n.is_read));
    assert_eq!(h.api.read_calls.load(Ordering::SeqCst), 2);

    h.engine.stop().await;
}

#[tokio::test]
async fn rejected_vote_restores_snapshot() {
    let mut h = harness();
    let mut item = post(h.peer);
    item.downvoters.insert(h.peer);
    h.api.feed.lock().push(item.clone());

    let sync = h.engine.start(h.session()).await;
    let _server = h.connected().await;

    h.api.fail_writes.store(true, Ordering::SeqCst);
    let result = sync.feed.vote(item.id, VoteDirection::Up).await;
    assert!(matches!(result, Err(SyncError::Api(_))));

    let after = sync.feed.get(item.id).expect("still present");
    assert_eq!(after.upvoters, item.upvoters);
    assert_eq!(after.downvoters, item.downvoters);

    h.engine.stop().await;
}

#[tokio::test]
async fn accepted_vote_toggles() {
    let mut h = harness();
    let item = post(h.peer);
    h.api.feed.lock().push(item.clone());

    let sync = h.engine.start(h.session()).await;
    let _server = h.connected().await;

    sync.feed.vote(item.id, VoteDirection::Up).await.expect("vote");
    let vote = |sync: &plaza_sync::Synchronizers| sync.feed.get(item.id).and_then(|i| i.vote_of(h.me));
    assert_eq!(vote(&sync), Some(VoteDirection::Up));

    sync.feed.vote(item.id, VoteDirection::Up).await.expect("clear vote");
    assert_eq!(vote(&sync), None);

    let missing = Uuid::new_v4();
    assert!(matches!(
        sync.feed.vote(missing, VoteDirection::Down).await,
        Err(SyncError::UnknownEntity(id)) if id == missing
    ));

    h.engine.stop().await;
}

#[tokio::test]
async fn pushed_votes_win_over_rollback() {
    let mut h = harness();
    let item = post(h.peer);
    h.api.feed.lock().push(item.clone());

    let sync = h.engine.start(h.session()).await;
    let server = h.connected().await;

    h.api.fail_writes.store(true, Ordering::SeqCst);
    let release = h.api.gate_votes();
    let feed = sync.feed.clone();
    let post_id = item.id;
    let vote = tokio::spawn(async move { feed.vote(post_id, VoteDirection::Up).await });

    let me = h.me;
    eventually(|| sync.feed.get(item.id).is_some_and(|i| i.upvoters.contains(&me))).await;

    let pushed = BTreeSet::from([h.peer, Uuid::new_v4()]);
    server.push(ChannelEvent::PostUpdate {
        id: item.id,
        patch: FeedPatch {
            upvoters: Some(pushed.clone()),
            downvoters: Some(BTreeSet::new()),
            ..FeedPatch::default()
        },
    });
    eventually(|| sync.feed.upvoters(item.id).as_ref() == Some(&pushed)).await;

    release.send(()).expect("vote still pending");
    let result = vote.await.expect("vote task");
    assert!(result.is_err());

    let after = sync.feed.get(item.id).expect("still present");
    assert_eq!(after.upvoters, pushed);
    assert!(after.downvoters.is_empty());

    h.engine.stop().await;
}

#[tokio::test]
async fn load_more_pages_and_drops_pages_from_before_a_refresh() {
    let mut h = harness();
    h.api.feed.lock().push(post(h.peer));
    let older = post(h.peer);
    h.api.older.lock().push(older.clone());

    let sync = h.engine.start(h.session()).await;
    let _server = h.connected().await;
    assert_eq!(sync.feed.cursor(), 1);
    assert!(sync.feed.has_more());

    assert_eq!(sync.feed.load_more().await.expect("page 2"), 1);
    assert_eq!(sync.feed.cursor(), 2);
    assert!(sync.feed.get(older.id).is_some());

    sync.feed.refresh().await.expect("refresh");
    assert_eq!(sync.feed.cursor(), 1);
    assert!(sync.feed.get(older.id).is_none());

    let release = h.api.gate_older_pages();
    let feed = sync.feed.clone();
    let late = tokio::spawn(async move { feed.load_more().await });
    eventually(|| h.api.older_gate.lock().is_none()).await;

    sync.feed.refresh().await.expect("refresh");
    release.send(()).expect("page still pending");
    assert_eq!(late.await.expect("load task").expect("late page"), 0);

    assert_eq!(sync.feed.cursor(), 1);
    assert!(sync.feed.get(older.id).is_none());
    assert_eq!(sync.feed.items().len(), 1);

    h.engine.stop().await;
}

#[tokio::test]
async fn patch_for_unknown_post_changes_nothing() {
    let mut h = harness();
    h.api.feed.lock().extend([post(h.peer), post(h.peer)]);

    let sync = h.engine.start(h.session()).await;
    let server = h.connected().await;
    let before = sync.feed.items();

    server.push(ChannelEvent::PostUpdate {
        id: Uuid::new_v4(),
        patch: FeedPatch {
            content: Some("edited".into()),
            comment_count: Some(42),
            ..FeedPatch::default()
        },
    });
    server.push(ChannelEvent::PostDelete { id: Uuid::new_v4() });
    // delivered after the two events above, so once it lands they have been handled
    let sentinel = post(h.peer);
    server.push(ChannelEvent::PostNew(sentinel.clone()));
    eventually(|| sync.feed.get(sentinel.id).is_some()).await;

    assert_eq!(&sync.feed.items()[1..], before.as_slice());

    h.engine.stop().await;
}

#[tokio::test]
async fn starting_twice_reuses_the_connection() {
    let mut h = harness();
    let first = h.engine.start(h.session()).await;
    let _server = h.connected().await;

    first.follows.seed(FollowState {
        user_id: h.peer,
        following: true,
        follower_count: 3,
    });
    let again = h.engine.start(h.session()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.connector.opens(), 1);
    assert_eq!(h.connector.live_links(), 1);
    assert_eq!(h.engine.dispatcher().handler_count(), 7);
    assert!(again.follows.get(h.peer).is_some_and(|f| f.following));

    let relogin = Session::new("token-2", h.me);
    h.engine.start(relogin).await;
    let second = h.servers.accept().await.expect("reconnected");
    assert_eq!(second.token, "token-2");
    eventually(|| h.connector.live_links() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.connector.opens(), 2);
    assert!(h.servers.try_accept().is_none());

    h.engine.stop().await;
    assert_eq!(h.engine.dispatcher().handler_count(), 0);
    assert_eq!(h.engine.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn new_session_pulls_with_new_credentials() {
    let mut h = harness();
    h.engine.start(h.session()).await;
    let _server = h.connected().await;
    assert_eq!(
        h.api.pulled_with.lock().last().map(String::as_str),
        Some("token-1")
    );

    h.engine.start(Session::new("token-2", h.me)).await;
    assert_eq!(h.api.token.lock().as_str(), "token-2");
    assert_eq!(
        h.api.pulled_with.lock().last().map(String::as_str),
        Some("token-2")
    );

    h.engine.stop().await;
}

// -- Two-phase send --

#[tokio::test]
async fn echo_before_response_leaves_one_message() {
    let mut h = harness();
    let conv = conversation(h.me, h.peer, 5);
    h.api.conversations.lock().push(conv.clone());

    let sync = h.engine.start(h.session()).await;
    let server = h.connected().await;

    let release = h.api.gate_sends();
    let conversations = sync.conversations.clone();
    let conv_id = conv.id;
    let send = tokio::spawn(async move { conversations.send(conv_id, "hi there").await });

    eventually(|| h.api.last_sent.lock().is_some()).await;
    let provisional = sync.conversations.messages(conv.id);
    assert_eq!(provisional.len(), 1);
    let temp_id = provisional[0].id;
    assert_eq!(sync.conversations.delivery(temp_id), Some(DeliveryStatus::Pending));

    let committed = h.api.last_sent.lock().clone().expect("request issued");
    server.push(ChannelEvent::Message(committed.clone()));
    eventually(|| sync.conversations.delivery(temp_id) == Some(DeliveryStatus::Sent)).await;

    release.send(()).expect("send still pending");
    let returned = send.await.expect("send task").expect("send succeeded");
    assert_eq!(returned.id, committed.id);

    let messages = sync.conversations.messages(conv.id);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, committed.id);
    assert_eq!(sync.conversations.unread(conv.id), 0);
    assert_eq!(sync.conversations.pending_sends(), 0);

    h.engine.stop().await;
}

#[tokio::test]
async fn failed_send_removes_provisional_message() {
    let mut h = harness();
    let mut conv = conversation(h.me, h.peer, 5);
    let earlier = message(conv.id, h.peer, h.me);
    conv.last_message = Some(earlier.clone());
    h.api.conversations.lock().push(conv.clone());

    let sync = h.engine.start(h.session()).await;
    let _server = h.connected().await;

    h.api.fail_writes.store(true, Ordering::SeqCst);
    let result = sync.conversations.send(conv.id, "lost").await;
    assert!(result.is_err());

    assert!(sync.conversations.messages(conv.id).is_empty());
    let after = sync.conversations.conversation(conv.id).expect("still listed");
    assert_eq!(after.last_message.map(|m| m.id), Some(earlier.id));
    assert_eq!(after.updated_at, conv.updated_at);

    h.engine.stop().await;
}

// -- Rooms --

#[tokio::test]
async fn open_conversation_rejoins_after_reconnect() {
    let mut h = harness();
    let conv = conversation(h.me, h.peer, 5);
    h.api.conversations.lock().push(conv.clone());

    let sync = h.engine.start(h.session()).await;
    let mut server = h.connected().await;

    sync.conversations.open(conv.id).await.expect("opened");
    let topic = Topic::conversation(conv.id);
    assert_eq!(server.next_command().await, Some(ChannelCommand::join(topic)));

    drop(server);
    let mut server = h.servers.accept().await.expect("reconnected");
    let cmd = tokio::time::timeout(Duration::from_secs(2), server.next_command())
        .await
        .expect("rejoin sent");
    assert_eq!(cmd, Some(ChannelCommand::join(topic)));

    sync.conversations.close();
    assert_eq!(server.next_command().await, Some(ChannelCommand::leave(topic)));

    h.engine.stop().await;
}

#[tokio::test]
async fn joined_community_streams_messages() {
    let mut h = harness();
    let sync = h.engine.start(h.session()).await;
    let mut server = h.connected().await;

    let community = Uuid::new_v4();
    sync.communities.seed(MembershipState {
        community_id: community,
        joined: false,
        member_count: 2,
    });
    let state = sync
        .communities
        .set_membership(community, true)
        .await
        .expect("joined");
    assert!(state.joined);
    assert_eq!(
        server.next_command().await,
        Some(ChannelCommand::join(Topic::community(community)))
    );

    let room = CommunityMessage {
        id: Uuid::new_v4(),
        community_id: community,
        author: user(h.peer),
        content: "welcome".into(),
        created_at: Utc::now(),
    };
    server.push(ChannelEvent::CommunityMessage(room.clone()));
    server.push(ChannelEvent::CommunityMessage(room.clone()));
    eventually(|| sync.communities.messages(community).len() == 1).await;

    server.push(ChannelEvent::CommunityMessageDeleted {
        community_id: community,
        message_id: room.id,
    });
    eventually(|| sync.communities.messages(community).is_empty()).await;

    h.engine.stop().await;
}
