//! 人工审批：审批请求与审批决策
//!
//! 执行到中断点时引擎生成 ApprovalRequest 并暂停；恢复时必须按顺序一一对应地提交 ApprovalDecision。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::ToolCall;

/// 决策类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionType {
    /// 按原参数执行
    Approve,
    /// 用决策中的参数替换后执行
    Edit,
    /// 跳过，并注入带反馈的失败结果
    Reject,
}

/// 单个待审批动作
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub tool_call_id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// 每个动作允许的决策
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewConfig {
    pub action_name: String,
    pub allowed_decisions: Vec<DecisionType>,
}

/// 审批请求
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub thread_id: String,
    pub action_requests: Vec<ActionRequest>,
    pub review_configs: Vec<ReviewConfig>,
    pub timestamp: DateTime<Utc>,
}

impl ApprovalRequest {
    /// 为需要审批的工具调用构建请求；每个动作都允许 approve / edit / reject
    pub fn for_calls(thread_id: &str, calls: &[ToolCall]) -> Self {
        let action_requests: Vec<ActionRequest> = calls
            .iter()
            .map(|c| ActionRequest {
                tool_call_id: c.id.clone(),
                name: c.name.clone(),
                args: c.args.clone(),
            })
            .collect();
        let review_configs = action_requests
            .iter()
            .map(|a| ReviewConfig {
                action_name: a.name.clone(),
                allowed_decisions: vec![DecisionType::Approve, DecisionType::Edit, DecisionType::Reject],
            })
            .collect();
        Self {
            thread_id: thread_id.to_string(),
            action_requests,
            review_configs,
            timestamp: Utc::now(),
        }
    }

    /// 校验决策列表；不合法时返回 Validation 错误，调用方不得修改任何状态
    pub fn validate(&self, decisions: &[ApprovalDecision]) -> Result<(), AgentError> {
        if decisions.len() != self.action_requests.len() {
            return Err(AgentError::validation(format!(
                "expected {} decision(s) for pending action requests, got {}",
                self.action_requests.len(),
                decisions.len()
            )));
        }
        for (i, decision) in decisions.iter().enumerate() {
            let allowed = self
                .review_configs
                .get(i)
                .map(|c| c.allowed_decisions.contains(&decision.decision_type))
                .unwrap_or(false);
            if !allowed {
                return Err(AgentError::validation(format!(
                    "decision '{:?}' is not allowed for action '{}'",
                    decision.decision_type, self.action_requests[i].name
                )));
            }
            if decision.decision_type == DecisionType::Edit
                && !matches!(decision.args, Some(serde_json::Value::Object(_)))
            {
                return Err(AgentError::validation(format!(
                    "edit decision for action '{}' requires an args object",
                    self.action_requests[i].name
                )));
            }
        }
        Ok(())
    }

    /// 将决策按 tool_call_id 对齐（须先 validate）
    pub fn pair(&self, decisions: Vec<ApprovalDecision>) -> HashMap<String, ApprovalDecision> {
        self.action_requests
            .iter()
            .map(|a| a.tool_call_id.clone())
            .zip(decisions)
            .collect()
    }
}

/// 审批决策
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    #[serde(rename = "type")]
    pub decision_type: DecisionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self {
            decision_type: DecisionType::Approve,
            args: None,
            feedback: None,
        }
    }

    pub fn edit(args: serde_json::Value) -> Self {
        Self {
            decision_type: DecisionType::Edit,
            args: Some(args),
            feedback: None,
        }
    }

    pub fn reject(feedback: impl Into<String>) -> Self {
        Self {
            decision_type: DecisionType::Reject,
            args: None,
            feedback: Some(feedback.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> ApprovalRequest {
        ApprovalRequest::for_calls(
            "t1",
            &[ToolCall::new("c1", "execute_command", json!({"command": "rm -rf /"}))],
        )
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let req = request();
        assert!(req.validate(&[]).is_err());
        assert!(req
            .validate(&[ApprovalDecision::approve(), ApprovalDecision::approve()])
            .is_err());
        assert!(req.validate(&[ApprovalDecision::approve()]).is_ok());
    }

    #[test]
    fn test_edit_requires_args() {
        let req = request();
        let bad = ApprovalDecision {
            decision_type: DecisionType::Edit,
            args: None,
            feedback: None,
        };
        assert!(req.validate(&[bad]).is_err());
        assert!(req.validate(&[ApprovalDecision::edit(json!({"command": "ls"}))]).is_ok());
    }

    #[test]
    fn test_decision_wire_format() {
        let d: ApprovalDecision =
            serde_json::from_value(json!({"type": "reject", "feedback": "too risky"})).unwrap();
        assert_eq!(d, ApprovalDecision::reject("too risky"));
    }
}
