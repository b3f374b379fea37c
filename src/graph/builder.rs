//! 执行图构建
//!
//! 用流式 API 声明节点与出边；每条出边是一个纯函数路由（只看当前状态与预算）。
//! 终结节点没有出边，执行它之后运行结束。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::SubagentEntry;
use crate::core::AgentError;
use crate::graph::node::{
    FinalNode, GenerateNode, Node, PlannerNode, ReflectNode, ReviseNode, ToolAccess, ToolScope,
    ToolsNode, AGENT_PROMPT, ORCHESTRATOR_PROMPT, SUBAGENT_PROMPT,
};
use crate::graph::ExecutionState;

pub const PLANNER: &str = "planner";
pub const GENERATE: &str = "generate";
pub const TOOLS: &str = "tools";
pub const REFLECT: &str = "reflect";
pub const REVISE: &str = "revise";
pub const FINAL: &str = "final";
pub const AGENT: &str = "agent";

/// 路由结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    To(&'static str),
    End,
}

/// 节点访问预算
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    pub max_iterations: usize,
}

impl Budget {
    pub fn exhausted(&self, state: &ExecutionState) -> bool {
        state.iteration_count >= self.max_iterations
    }
}

pub type Router = fn(&ExecutionState, &Budget) -> Route;

pub struct Graph {
    nodes: HashMap<&'static str, Arc<dyn Node>>,
    edges: HashMap<&'static str, Router>,
    entry: &'static str,
    finalizer: &'static str,
    interrupt_before: HashSet<&'static str>,
}

impl Graph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    pub fn entry(&self) -> &'static str {
        self.entry
    }

    pub fn finalizer(&self) -> &'static str {
        self.finalizer
    }

    pub fn node(&self, name: &str) -> Option<&Arc<dyn Node>> {
        self.nodes.get(name)
    }

    /// 检查点中记录的节点名 → 图内节点名
    pub fn resolve(&self, name: &str) -> Option<&'static str> {
        self.nodes.keys().copied().find(|k| *k == name)
    }

    pub fn interrupts_before(&self, name: &str) -> bool {
        self.interrupt_before.contains(name)
    }

    /// 执行完 `name` 之后的下一个节点；None 表示运行结束
    pub fn next(&self, name: &str, state: &ExecutionState, budget: &Budget) -> Option<&'static str> {
        match self.edges.get(name).map(|route| route(state, budget)) {
            Some(Route::To(next)) => Some(next),
            Some(Route::End) | None => None,
        }
    }
}

#[derive(Default)]
pub struct GraphBuilder {
    nodes: HashMap<&'static str, Arc<dyn Node>>,
    edges: HashMap<&'static str, Router>,
    entry: Option<&'static str>,
    finalizer: Option<&'static str>,
    interrupt_before: HashSet<&'static str>,
}

impl GraphBuilder {
    pub fn node(mut self, name: &'static str, node: impl Node + 'static) -> Self {
        self.nodes.insert(name, Arc::new(node));
        self
    }

    pub fn edge(mut self, from: &'static str, router: Router) -> Self {
        self.edges.insert(from, router);
        self
    }

    pub fn entry(mut self, name: &'static str) -> Self {
        self.entry = Some(name);
        self
    }

    /// 终结节点：预算耗尽时强制跳转，执行后结束
    pub fn finalizer(mut self, name: &'static str) -> Self {
        self.finalizer = Some(name);
        self
    }

    /// 在执行该节点前检查是否需要人工审批
    pub fn interrupt_before(mut self, name: &'static str) -> Self {
        self.interrupt_before.insert(name);
        self
    }

    pub fn build(self) -> Result<Graph, AgentError> {
        let entry = self
            .entry
            .ok_or_else(|| AgentError::Config("graph has no entry node".to_string()))?;
        let finalizer = self
            .finalizer
            .ok_or_else(|| AgentError::Config("graph has no finalizer node".to_string()))?;
        for name in [entry, finalizer]
            .into_iter()
            .chain(self.interrupt_before.iter().copied())
        {
            if !self.nodes.contains_key(name) {
                return Err(AgentError::Config(format!("graph references unknown node '{name}'")));
            }
        }
        for name in self.nodes.keys() {
            if *name != finalizer && !self.edges.contains_key(name) {
                return Err(AgentError::Config(format!("node '{name}' has no outgoing edge")));
            }
        }
        Ok(Graph {
            nodes: self.nodes,
            edges: self.edges,
            entry,
            finalizer,
            interrupt_before: self.interrupt_before,
        })
    }
}

pub fn route_planner(_: &ExecutionState, _: &Budget) -> Route {
    Route::To(GENERATE)
}

/// 有待执行调用 → tools；预算耗尽 → final；本轮未用过工具（首个无工具回答）→ final；否则 → reflect
pub fn route_generate(state: &ExecutionState, budget: &Budget) -> Route {
    if !state.pending_calls().is_empty() {
        Route::To(TOOLS)
    } else if budget.exhausted(state) || !state.tools_used_this_turn() {
        Route::To(FINAL)
    } else {
        Route::To(REFLECT)
    }
}

pub fn route_tools(state: &ExecutionState, budget: &Budget) -> Route {
    if budget.exhausted(state) {
        Route::To(REFLECT)
    } else {
        Route::To(GENERATE)
    }
}

pub fn route_reflect(state: &ExecutionState, budget: &Budget) -> Route {
    if state.is_complete || budget.exhausted(state) {
        Route::To(FINAL)
    } else {
        Route::To(REVISE)
    }
}

pub fn route_revise(state: &ExecutionState, _: &Budget) -> Route {
    if state.pending_calls().is_empty() {
        Route::To(REFLECT)
    } else {
        Route::To(TOOLS)
    }
}

pub fn route_agent(state: &ExecutionState, _: &Budget) -> Route {
    if state.pending_calls().is_empty() {
        Route::To(FINAL)
    } else {
        Route::To(TOOLS)
    }
}

pub fn route_agent_tools(state: &ExecutionState, budget: &Budget) -> Route {
    if budget.exhausted(state) {
        Route::To(FINAL)
    } else {
        Route::To(AGENT)
    }
}

/// 单智能体反思图：planner → generate ⇄ tools → reflect → revise / final
pub fn reflection_graph() -> Result<Graph, AgentError> {
    let access = ToolAccess {
        scope: ToolScope::All,
        todos: true,
        delegation: false,
    };
    Graph::builder()
        .node(PLANNER, PlannerNode)
        .node(GENERATE, GenerateNode::new(GENERATE, AGENT_PROMPT, access.clone()))
        .node(TOOLS, ToolsNode)
        .node(REFLECT, ReflectNode)
        .node(REVISE, ReviseNode::new(AGENT_PROMPT, access))
        .node(FINAL, FinalNode)
        .edge(PLANNER, route_planner)
        .edge(GENERATE, route_generate)
        .edge(TOOLS, route_tools)
        .edge(REFLECT, route_reflect)
        .edge(REVISE, route_revise)
        .entry(PLANNER)
        .finalizer(FINAL)
        .interrupt_before(TOOLS)
        .build()
}

/// 编排器图：agent ⇄ tools → final，agent 可写待办、可通过 task 委派子智能体
pub fn deep_graph() -> Result<Graph, AgentError> {
    let access = ToolAccess {
        scope: ToolScope::All,
        todos: true,
        delegation: true,
    };
    Graph::builder()
        .node(AGENT, GenerateNode::new(AGENT, ORCHESTRATOR_PROMPT, access))
        .node(TOOLS, ToolsNode)
        .node(FINAL, FinalNode)
        .edge(AGENT, route_agent)
        .edge(TOOLS, route_agent_tools)
        .entry(AGENT)
        .finalizer(FINAL)
        .interrupt_before(TOOLS)
        .build()
}

/// 子智能体图：不会中断，因此需要审批的工具总被剔除；
/// 其余为声明的工具，未声明时为全部工具
pub fn subagent_graph(entry: &SubagentEntry, gated: &[String]) -> Result<Graph, AgentError> {
    let scope = if entry.tools.is_empty() {
        ToolScope::AllExcept(gated.to_vec())
    } else {
        let allowed: Vec<String> = entry
            .tools
            .iter()
            .filter(|t| !gated.contains(t))
            .cloned()
            .collect();
        if allowed.len() < entry.tools.len() {
            tracing::warn!(
                subagent = %entry.name,
                "approval-gated tools removed from subagent scope"
            );
        }
        ToolScope::Only(allowed)
    };
    let prompt = entry
        .system_prompt
        .clone()
        .unwrap_or_else(|| SUBAGENT_PROMPT.to_string());
    let access = ToolAccess {
        scope,
        todos: false,
        delegation: false,
    };
    Graph::builder()
        .node(AGENT, GenerateNode::new(AGENT, prompt, access))
        .node(TOOLS, ToolsNode)
        .node(FINAL, FinalNode)
        .edge(AGENT, route_agent)
        .edge(TOOLS, route_agent_tools)
        .entry(AGENT)
        .finalizer(FINAL)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Message, ToolCall};
    use serde_json::json;

    fn budget(max: usize) -> Budget {
        Budget { max_iterations: max }
    }

    fn with_call() -> ExecutionState {
        let mut state = ExecutionState::with_input(Message::user("check disks"));
        state.messages.push(Message::assistant_with_calls(
            "",
            vec![ToolCall::new("c1", "execute_command", json!({"command": "df -h"}))],
        ));
        state
    }

    #[test]
    fn test_generate_routes() {
        assert_eq!(route_generate(&with_call(), &budget(10)), Route::To(TOOLS));

        // 首个无工具回答直接结束
        let mut state = ExecutionState::with_input(Message::user("hi"));
        state.messages.push(Message::assistant("hello"));
        assert_eq!(route_generate(&state, &budget(10)), Route::To(FINAL));

        // 用过工具后进入反思
        let mut state = with_call();
        state.messages.push(Message::tool("c1", "ok"));
        state.messages.push(Message::assistant("disks are fine"));
        assert_eq!(route_generate(&state, &budget(10)), Route::To(REFLECT));
        state.iteration_count = 10;
        assert_eq!(route_generate(&state, &budget(10)), Route::To(FINAL));
    }

    #[test]
    fn test_tools_forces_reflect_when_exhausted() {
        let mut state = ExecutionState::default();
        assert_eq!(route_tools(&state, &budget(3)), Route::To(GENERATE));
        state.iteration_count = 3;
        assert_eq!(route_tools(&state, &budget(3)), Route::To(REFLECT));
    }

    #[test]
    fn test_reflect_and_revise_routes() {
        let mut state = ExecutionState::default();
        assert_eq!(route_reflect(&state, &budget(5)), Route::To(REVISE));
        state.is_complete = true;
        assert_eq!(route_reflect(&state, &budget(5)), Route::To(FINAL));

        assert_eq!(route_revise(&with_call(), &budget(5)), Route::To(TOOLS));
        assert_eq!(route_revise(&ExecutionState::default(), &budget(5)), Route::To(REFLECT));
    }

    #[test]
    fn test_factories_build() {
        let g = reflection_graph().unwrap();
        assert_eq!(g.entry(), PLANNER);
        assert!(g.interrupts_before(TOOLS));
        assert_eq!(g.next(FINAL, &ExecutionState::default(), &budget(1)), None);
        assert_eq!(g.resolve("revise"), Some(REVISE));

        let d = deep_graph().unwrap();
        assert_eq!(d.entry(), AGENT);

        let entry = SubagentEntry {
            name: "researcher".into(),
            description: "looks things up".into(),
            system_prompt: None,
            tools: vec![],
        };
        let s = subagent_graph(&entry, &["execute_command".to_string()]).unwrap();
        assert!(!s.interrupts_before(TOOLS));
    }

    #[test]
    fn test_missing_edge_rejected() {
        let err = Graph::builder()
            .node(AGENT, FinalNode)
            .node(FINAL, FinalNode)
            .entry(AGENT)
            .finalizer(FINAL)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
