//! 关联状态机
//!
//! 一次关联只承载一个请求：建立、协商、发送、收到响应或超时、关闭。

use std::collections::HashMap;
use std::fmt;

use courier_core::{CourierError, Result};
use tracing::debug;

/// 关联状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationState {
    Idle,
    Associating,
    ContextNegotiated,
    Sending,
    Succeeded,
    Rejected,
    TimedOut,
    Closed,
}

/// 状态转换事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationEvent {
    /// 连接建立并发出 A-ASSOCIATE-RQ
    Connect,
    /// 收到 A-ASSOCIATE-AC 且上下文被接受
    Accepted,
    /// 收到 A-ASSOCIATE-RJ 或上下文未被接受
    AssociationRejected,
    /// 发出 DIMSE 请求
    RequestSent,
    /// 响应状态为成功或警告
    ResponseSuccess,
    /// 响应状态为失败
    ResponseFailure,
    Timeout,
    /// 对端中止或连接断开
    Aborted,
    Release,
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 关联状态机
#[derive(Debug)]
pub struct AssociationStateMachine {
    transitions: HashMap<(AssociationState, AssociationEvent), AssociationState>,
}

impl AssociationStateMachine {
    pub fn new() -> Self {
        use AssociationEvent as E;
        use AssociationState as S;

        let mut transitions = HashMap::new();
        transitions.insert((S::Idle, E::Connect), S::Associating);
        transitions.insert((S::Associating, E::Accepted), S::ContextNegotiated);
        transitions.insert((S::Associating, E::AssociationRejected), S::Rejected);
        transitions.insert((S::ContextNegotiated, E::RequestSent), S::Sending);
        transitions.insert((S::Sending, E::ResponseSuccess), S::Succeeded);
        transitions.insert((S::Sending, E::ResponseFailure), S::Rejected);

        for active in [S::Associating, S::ContextNegotiated, S::Sending] {
            transitions.insert((active, E::Timeout), S::TimedOut);
            transitions.insert((active, E::Aborted), S::Closed);
        }
        for finished in [S::ContextNegotiated, S::Succeeded, S::Rejected, S::TimedOut] {
            transitions.insert((finished, E::Release), S::Closed);
        }

        Self { transitions }
    }

    pub fn can_transition(&self, from: AssociationState, event: AssociationEvent) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    pub fn transition(
        &self,
        from: AssociationState,
        event: AssociationEvent,
    ) -> Result<AssociationState> {
        self.transitions
            .get(&(from, event))
            .copied()
            .ok_or_else(|| CourierError::InvalidStateTransition {
                from: from.to_string(),
                event: format!("{:?}", event),
            })
    }
}

impl Default for AssociationStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个关联的当前状态
#[derive(Debug)]
pub struct AssociationTracker {
    machine: AssociationStateMachine,
    state: AssociationState,
}

impl AssociationTracker {
    pub fn new() -> Self {
        Self {
            machine: AssociationStateMachine::new(),
            state: AssociationState::Idle,
        }
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn apply(&mut self, event: AssociationEvent) -> Result<AssociationState> {
        let next = self.machine.transition(self.state, event)?;
        debug!(from = %self.state, to = %next, "关联状态转换");
        self.state = next;
        Ok(next)
    }
}

impl Default for AssociationTracker {
    fn default() -> Self {
        Self::new()
    }
}
