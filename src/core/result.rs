//! AgentResult：智能体与编排阶段统一的返回信封
//!
//! success=false 是值而不是错误，调用方据此分支；data 按阶段强类型，metadata 放横切字段（耗时、降级标记等）。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl<T> AgentResult<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// 失败但仍携带部分数据（如流水线中途终止时已完成的阶段）
    pub fn failure_with(data: T, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Some(data),
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// 追加一条元数据；无法序列化的值记录告警后跳过
    pub fn with_metadata(mut self, key: &str, value: impl Serialize) -> Self {
        self.insert_metadata(key, value);
        self
    }

    pub fn insert_metadata(&mut self, key: &str, value: impl Serialize) {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.metadata.insert(key.to_string(), v);
            }
            Err(e) => tracing::warn!(key, error = %e, "Skipping unserializable metadata"),
        }
    }

    /// 成功且带数据时返回数据引用
    pub fn data(&self) -> Option<&T> {
        if self.success {
            self.data.as_ref()
        } else {
            None
        }
    }

    pub fn into_data(self) -> Option<T> {
        if self.success {
            self.data
        } else {
            None
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> AgentResult<U> {
        AgentResult {
            success: self.success,
            data: self.data.map(f),
            message: self.message,
            metadata: self.metadata,
        }
    }
}
