//! 智能体通信通道：按收件人分组的有界邮箱
//!
//! 显式构造后以 Arc 注入编排器与各智能体，不使用全局实例。
//! - 同一收件人的消息按发送顺序投递（FIFO），不同收件人之间无相对顺序
//! - poll 非阻塞：取走当前全部排队消息，无消息或未注册时返回空列表
//! - 每个邮箱有容量上限，溢出时先淘汰优先级最低的消息（同级取最旧），新消息优先级更低时直接丢弃
//! - 状态广播只投递给订阅了状态更新的邮箱，其余邮箱只收点对点消息
//! - 所有读写经同一把 Mutex，可在并行阶段中安全调用；锁中毒时恢复内部数据继续使用

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 编排器的固定收件名
pub const ORCHESTRATOR: &str = "orchestrator";
/// 广播消息在历史中的收件名
pub const BROADCAST: &str = "all";

const DEFAULT_CAPACITY: usize = 256;
const DEFAULT_HISTORY_LIMIT: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Feedback,
    RevisionRequest,
    QualityAlert,
    StatusUpdate,
}

impl MessageType {
    /// 默认优先级（1–5，5 最高）
    pub fn default_priority(self) -> u8 {
        match self {
            MessageType::StatusUpdate => 2,
            MessageType::Feedback => 3,
            MessageType::RevisionRequest => 4,
            MessageType::QualityAlert => 5,
        }
    }
}

/// 消息内容（按类型区分）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Feedback {
        issues: Vec<String>,
        suggestions: Vec<String>,
        target_score: f64,
    },
    RevisionRequest {
        reason: String,
        suggestions: Vec<String>,
    },
    QualityAlert {
        iteration: u32,
        score: f64,
        threshold: f64,
        dimension_scores: BTreeMap<String, f64>,
    },
    StatusUpdate {
        status: String,
    },
}

impl MessagePayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::Feedback { .. } => MessageType::Feedback,
            MessagePayload::RevisionRequest { .. } => MessageType::RevisionRequest,
            MessagePayload::QualityAlert { .. } => MessageType::QualityAlert,
            MessagePayload::StatusUpdate { .. } => MessageType::StatusUpdate,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub payload: MessagePayload,
    pub timestamp: DateTime<Utc>,
    pub priority: u8,
}

impl AgentMessage {
    pub fn new(from: impl Into<String>, to: impl Into<String>, payload: MessagePayload) -> Self {
        let priority = payload.message_type().default_priority();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from_agent: from.into(),
            to_agent: to.into(),
            payload,
            timestamp: Utc::now(),
            priority,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 5);
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

/// 一次发送的投递结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// 已入队，邮箱已满，淘汰了一条优先级不高于它的旧消息
    QueuedEvicted,
    /// 邮箱已满且排队消息优先级都更高，本条未入队
    Rejected,
    /// 收件人未注册，仅记录历史
    Unregistered,
}

#[derive(Default)]
struct Mailbox {
    queue: VecDeque<AgentMessage>,
    status_updates: bool,
}

#[derive(Default)]
struct ChannelState {
    mailboxes: HashMap<String, Mailbox>,
    history: VecDeque<AgentMessage>,
    dropped: u64,
}

pub struct CommunicationChannel {
    state: Mutex<ChannelState>,
    capacity: usize,
    history_limit: usize,
}

impl Default for CommunicationChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl CommunicationChannel {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// 指定每个邮箱的容量上限（至少为 1）
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ChannelState::default()),
            capacity: capacity.max(1),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 注册收件人；重复注册不清空已有消息
    pub fn register(&self, agent: &str) {
        self.lock().mailboxes.entry(agent.to_string()).or_default();
    }

    /// 注册并订阅其他智能体的状态广播；只应由会 poll 的收件人调用
    pub fn subscribe_status(&self, agent: &str) {
        self.lock()
            .mailboxes
            .entry(agent.to_string())
            .or_default()
            .status_updates = true;
    }

    pub fn is_registered(&self, agent: &str) -> bool {
        self.lock().mailboxes.contains_key(agent)
    }

    pub fn send(&self, message: AgentMessage) -> Delivery {
        let mut state = self.lock();
        let delivery = Self::enqueue(&mut state, self.capacity, &message);
        Self::record(&mut state, self.history_limit, message);
        delivery
    }

    fn enqueue(state: &mut ChannelState, capacity: usize, message: &AgentMessage) -> Delivery {
        let Some(mailbox) = state.mailboxes.get_mut(&message.to_agent) else {
            return Delivery::Unregistered;
        };
        let queue = &mut mailbox.queue;
        let mut delivery = Delivery::Queued;
        if queue.len() >= capacity {
            // min_by_key 在并列时取第一个，即同级中最旧的一条
            let lowest = queue
                .iter()
                .enumerate()
                .min_by_key(|(_, m)| m.priority)
                .map(|(index, m)| (index, m.priority));
            delivery = match lowest {
                Some((_, priority)) if message.priority < priority => Delivery::Rejected,
                Some((index, _)) => {
                    queue.remove(index);
                    Delivery::QueuedEvicted
                }
                None => Delivery::Queued,
            };
        }
        if delivery != Delivery::Rejected {
            queue.push_back(message.clone());
        }
        if matches!(delivery, Delivery::QueuedEvicted | Delivery::Rejected) {
            state.dropped += 1;
            tracing::warn!(
                recipient = %message.to_agent,
                capacity,
                priority = message.priority,
                "Mailbox full, dropped lowest-priority message"
            );
        }
        delivery
    }

    fn record(state: &mut ChannelState, limit: usize, message: AgentMessage) {
        if state.history.len() >= limit {
            state.history.pop_front();
        }
        state.history.push_back(message);
    }

    pub fn send_feedback(&self, from: &str, to: &str, payload: MessagePayload) -> Delivery {
        self.send(AgentMessage::new(from, to, payload))
    }

    pub fn request_revision(
        &self,
        from: &str,
        to: &str,
        reason: impl Into<String>,
        suggestions: Vec<String>,
    ) -> Delivery {
        self.send(AgentMessage::new(
            from,
            to,
            MessagePayload::RevisionRequest {
                reason: reason.into(),
                suggestions,
            },
        ))
    }

    /// 质量警报总是发给编排器
    pub fn send_quality_alert(&self, from: &str, payload: MessagePayload) -> Delivery {
        self.send(AgentMessage::new(from, ORCHESTRATOR, payload))
    }

    /// 向除发送者外订阅了状态更新的收件人投递，历史中只记一条；返回投递数
    pub fn broadcast_status(&self, from: &str, status: impl Into<String>) -> usize {
        let message = AgentMessage::new(
            from,
            BROADCAST,
            MessagePayload::StatusUpdate {
                status: status.into(),
            },
        );
        let mut state = self.lock();
        let recipients: Vec<String> = state
            .mailboxes
            .iter()
            .filter(|(name, mailbox)| mailbox.status_updates && name.as_str() != from)
            .map(|(name, _)| name.clone())
            .collect();
        for recipient in &recipients {
            let mut copy = message.clone();
            copy.to_agent = recipient.clone();
            Self::enqueue(&mut state, self.capacity, &copy);
        }
        Self::record(&mut state, self.history_limit, message);
        recipients.len()
    }

    /// 取走收件人当前全部消息（非阻塞）
    pub fn poll(&self, agent: &str) -> Vec<AgentMessage> {
        self.lock()
            .mailboxes
            .get_mut(agent)
            .map(|mailbox| mailbox.queue.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn pending(&self, agent: &str) -> usize {
        self.lock().mailboxes.get(agent).map_or(0, |mailbox| mailbox.queue.len())
    }

    /// 消息历史；指定 agent 时只返回其发出或收到的消息
    pub fn history(&self, agent: Option<&str>) -> Vec<AgentMessage> {
        let state = self.lock();
        state
            .history
            .iter()
            .filter(|m| agent.map_or(true, |a| m.from_agent == a || m.to_agent == a))
            .cloned()
            .collect()
    }

    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn status(text: &str) -> MessagePayload {
        MessagePayload::StatusUpdate {
            status: text.to_string(),
        }
    }

    #[test]
    fn test_per_recipient_fifo() {
        let channel = CommunicationChannel::new();
        channel.register("content");
        let a = AgentMessage::new("quality", "content", status("A"));
        let b = AgentMessage::new("quality", "content", status("B"));
        channel.send(a.clone());
        channel.send(b.clone());

        let polled = channel.poll("content");
        assert_eq!(polled, vec![a, b]);
        assert!(channel.poll("content").is_empty());
    }

    #[test]
    fn test_poll_unregistered_or_empty_returns_empty() {
        let channel = CommunicationChannel::new();
        assert!(channel.poll("nobody").is_empty());
        channel.register("content");
        assert!(channel.poll("content").is_empty());
    }

    #[test]
    fn test_unregistered_recipient_only_recorded() {
        let channel = CommunicationChannel::new();
        let delivery = channel.send(AgentMessage::new("a", "ghost", status("x")));
        assert_eq!(delivery, Delivery::Unregistered);
        assert_eq!(channel.history(Some("ghost")).len(), 1);
        assert!(channel.poll("ghost").is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let channel = CommunicationChannel::with_capacity(2);
        channel.register("content");
        for label in ["1", "2", "3"] {
            channel.send(AgentMessage::new("q", "content", status(label)));
        }
        let polled = channel.poll("content");
        let labels: Vec<_> = polled
            .iter()
            .map(|m| match &m.payload {
                MessagePayload::StatusUpdate { status } => status.clone(),
                _ => String::new(),
            })
            .collect();
        assert_eq!(labels, vec!["2", "3"]);
        assert_eq!(channel.dropped_count(), 1);
    }

    fn alert(iteration: u32) -> MessagePayload {
        MessagePayload::QualityAlert {
            iteration,
            score: 5.0,
            threshold: 7.0,
            dimension_scores: BTreeMap::new(),
        }
    }

    #[test]
    fn test_overflow_evicts_lowest_priority_first() {
        let channel = CommunicationChannel::with_capacity(2);
        channel.register(ORCHESTRATOR);
        channel.send_quality_alert("quality", alert(0));
        channel.send(AgentMessage::new("content", ORCHESTRATOR, status("working")));
        let delivery = channel.send_quality_alert("quality", alert(1));
        assert_eq!(delivery, Delivery::QueuedEvicted);

        let polled = channel.poll(ORCHESTRATOR);
        assert_eq!(polled.len(), 2);
        assert!(polled.iter().all(|m| m.message_type() == MessageType::QualityAlert));
    }

    #[test]
    fn test_full_mailbox_rejects_lower_priority_message() {
        let channel = CommunicationChannel::with_capacity(1);
        channel.register(ORCHESTRATOR);
        channel.send_quality_alert("quality", alert(0));
        let delivery = channel.send(AgentMessage::new("content", ORCHESTRATOR, status("working")));
        assert_eq!(delivery, Delivery::Rejected);
        assert_eq!(channel.dropped_count(), 1);
        assert_eq!(channel.poll(ORCHESTRATOR)[0].message_type(), MessageType::QualityAlert);
        // 仍然记入历史
        assert_eq!(channel.history(Some("content")).len(), 1);
    }

    #[test]
    fn test_quality_alert_goes_to_orchestrator() {
        let channel = CommunicationChannel::new();
        channel.register(ORCHESTRATOR);
        channel.send_quality_alert("quality", alert(0));
        let polled = channel.poll(ORCHESTRATOR);
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].priority, 5);
        assert_eq!(polled[0].message_type(), MessageType::QualityAlert);
    }

    #[test]
    fn test_broadcast_reaches_subscribers_except_sender() {
        let channel = CommunicationChannel::new();
        channel.register(ORCHESTRATOR);
        channel.subscribe_status("knowledge");
        channel.subscribe_status("strategy");
        let delivered = channel.broadcast_status("knowledge", "completed");
        assert_eq!(delivered, 1);
        assert!(channel.poll("knowledge").is_empty());
        assert_eq!(channel.pending(ORCHESTRATOR), 0);
        assert_eq!(channel.poll("strategy").len(), 1);
        assert_eq!(channel.history(None).len(), 1);
        assert_eq!(channel.history(None)[0].to_agent, BROADCAST);
    }

    #[tokio::test]
    async fn test_concurrent_senders_keep_per_sender_order() {
        let channel = Arc::new(CommunicationChannel::new());
        channel.register("sink");

        let mut handles = Vec::new();
        for sender in ["a", "b"] {
            let channel = channel.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    channel.send(AgentMessage::new(sender, "sink", status(&i.to_string())));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let polled = channel.poll("sink");
        assert_eq!(polled.len(), 100);
        for sender in ["a", "b"] {
            let seq: Vec<u32> = polled
                .iter()
                .filter(|m| m.from_agent == sender)
                .filter_map(|m| match &m.payload {
                    MessagePayload::StatusUpdate { status } => status.parse().ok(),
                    _ => None,
                })
                .collect();
            assert_eq!(seq, (0..50).collect::<Vec<_>>());
        }
    }
}
