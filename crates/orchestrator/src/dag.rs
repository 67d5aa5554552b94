//! DAG model: nodes, edges, validation, ordering, and layout

use chrono::{DateTime, Utc};
use finflow_common::{
    DagId, Error, NodeId, NodeType, Result, TaskPriority, TaskStatus, ValueMap,
};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use uuid::Uuid;

/// Default wall-clock bound for a single node run
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default per-node retry budget
pub const DEFAULT_NODE_MAX_RETRIES: u32 = 3;

/// Layout coordinate used by external renderers; non-semantic
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A task embedded in a DAG, carrying its own status and dependencies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagNode {
    pub id: NodeId,
    pub name: String,
    pub node_type: NodeType,
    pub task_type: Option<String>,
    pub params: ValueMap,
    pub priority: TaskPriority,
    pub timeout: Duration,
    pub max_retries: u32,
    /// Reverse index over `dag.edges`; refreshed on every mutation
    pub dependencies: HashSet<NodeId>,
    /// Reverse index over `dag.edges`; refreshed on every mutation
    pub dependents: HashSet<NodeId>,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub result: Option<ValueMap>,
    pub error: Option<String>,
    pub progress: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub position: Position,
}

impl DagNode {
    pub fn new(id: impl Into<NodeId>, name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            node_type: NodeType::Task,
            task_type: Some(task_type.into()),
            params: ValueMap::new(),
            priority: TaskPriority::Normal,
            timeout: DEFAULT_NODE_TIMEOUT,
            max_retries: DEFAULT_NODE_MAX_RETRIES,
            dependencies: HashSet::new(),
            dependents: HashSet::new(),
            status: TaskStatus::Pending,
            retry_count: 0,
            result: None,
            error: None,
            progress: 0.0,
            started_at: None,
            completed_at: None,
            position: Position::default(),
        }
    }

    pub fn with_node_type(mut self, node_type: NodeType) -> Self {
        self.node_type = node_type;
        self
    }

    pub fn with_params(mut self, params: ValueMap) -> Self {
        self.params = params;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Declare dependencies; converted to edges when the node joins a DAG
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.dependencies.extend(dependencies.into_iter().map(Into::into));
        self
    }
}

/// An edge connecting two nodes in the DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagEdge {
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    pub label: String,
    pub condition: Option<String>,
}

/// Structural validation outcome
#[derive(Debug, Clone)]
pub struct DagValidation {
    pub has_cycle: bool,
    pub dangling: Vec<(NodeId, NodeId)>,
    pub max_depth: usize,
}

impl DagValidation {
    pub fn is_valid(&self) -> bool {
        !self.has_cycle && self.dangling.is_empty()
    }
}

/// Directed acyclic graph of task nodes.
///
/// The DAG owns every node; edges are stored once and the per-node
/// dependency/dependent sets are derived reverse indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dag {
    pub id: DagId,
    pub name: String,
    pub description: String,
    nodes: HashMap<NodeId, DagNode>,
    insertion: Vec<NodeId>,
    edges: Vec<DagEdge>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Mutable context shared across nodes; written by the engine only
    pub context: ValueMap,
    #[serde(skip)]
    topo_cache: Option<Vec<NodeId>>,
}

impl Dag {
    pub fn new(name: impl Into<String>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self::with_id(format!("dag_{}", &suffix[..8]), name)
    }

    pub fn with_id(id: impl Into<DagId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            nodes: HashMap::new(),
            insertion: Vec::new(),
            edges: Vec::new(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            context: ValueMap::new(),
            topo_cache: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a node; its declared dependencies become edges
    pub fn add_node(&mut self, node: DagNode) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(Error::Validation(format!("duplicate node id: {}", node.id)));
        }

        for dep in &node.dependencies {
            self.push_edge(dep.clone(), node.id.clone(), String::new(), None);
        }

        self.insertion.push(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
        self.refresh_indices();
        self.topo_cache = None;
        Ok(())
    }

    /// Add an edge between two nodes
    pub fn add_edge(
        &mut self,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        label: impl Into<String>,
    ) -> Result<String> {
        let source = source.into();
        let target = target.into();
        let edge_id = self.push_edge(source, target, label.into(), None);
        self.refresh_indices();
        self.topo_cache = None;
        Ok(edge_id)
    }

    fn push_edge(
        &mut self,
        source: NodeId,
        target: NodeId,
        label: String,
        condition: Option<String>,
    ) -> String {
        if let Some(existing) = self
            .edges
            .iter()
            .find(|e| e.source == source && e.target == target)
        {
            return existing.id.clone();
        }
        let edge_id = format!("edge_{source}_{target}");
        self.edges.push(DagEdge {
            id: edge_id.clone(),
            source,
            target,
            label,
            condition,
        });
        edge_id
    }

    /// Remove a node and its incident edges
    pub fn remove_node(&mut self, node_id: &str) -> Option<DagNode> {
        let node = self.nodes.remove(node_id)?;
        self.insertion.retain(|id| id != node_id);
        self.edges
            .retain(|e| e.source != node_id && e.target != node_id);
        self.refresh_indices();
        self.topo_cache = None;
        Some(node)
    }

    /// Rebuild the per-node reverse indices from the edge list
    fn refresh_indices(&mut self) {
        for node in self.nodes.values_mut() {
            node.dependencies.clear();
            node.dependents.clear();
        }
        let pairs: Vec<(NodeId, NodeId)> = self
            .edges
            .iter()
            .map(|e| (e.source.clone(), e.target.clone()))
            .collect();
        for (source, target) in pairs {
            if !self.nodes.contains_key(&source) || !self.nodes.contains_key(&target) {
                continue;
            }
            if let Some(node) = self.nodes.get_mut(&target) {
                node.dependencies.insert(source.clone());
            }
            if let Some(node) = self.nodes.get_mut(&source) {
                node.dependents.insert(target);
            }
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&DagNode> {
        self.nodes.get(node_id)
    }

    pub(crate) fn node_mut(&mut self, node_id: &str) -> Option<&mut DagNode> {
        self.nodes.get_mut(node_id)
    }

    /// Nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &DagNode> {
        self.insertion.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn node_ids(&self) -> &[NodeId] {
        &self.insertion
    }

    pub fn edges(&self) -> &[DagEdge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Structural validation: dangling references and cycles
    pub fn validate(&self) -> DagValidation {
        let mut dangling = Vec::new();
        for edge in &self.edges {
            if !self.nodes.contains_key(&edge.source) {
                dangling.push((edge.target.clone(), edge.source.clone()));
            }
            if !self.nodes.contains_key(&edge.target) {
                dangling.push((edge.source.clone(), edge.target.clone()));
            }
        }

        DagValidation {
            has_cycle: self.has_cycle(),
            dangling,
            max_depth: self.max_depth(),
        }
    }

    /// Validate, mapping the first defect onto its error kind
    pub fn ensure_valid(&self) -> Result<()> {
        let validation = self.validate();
        if let Some((node, missing)) = validation.dangling.first() {
            return Err(Error::DanglingDependency {
                node: node.clone(),
                missing: missing.clone(),
            });
        }
        if validation.has_cycle {
            return Err(Error::CycleDetected(self.id.clone()));
        }
        Ok(())
    }

    /// Three-colour DFS over the dependent edges; a grey-to-grey edge is a cycle
    fn has_cycle(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Grey,
            Black,
        }

        fn visit(
            node_id: &NodeId,
            nodes: &HashMap<NodeId, DagNode>,
            colours: &mut HashMap<NodeId, Colour>,
        ) -> bool {
            colours.insert(node_id.clone(), Colour::Grey);
            if let Some(node) = nodes.get(node_id) {
                for next in &node.dependents {
                    match colours.get(next).copied().unwrap_or(Colour::White) {
                        Colour::Grey => return true,
                        Colour::White => {
                            if visit(next, nodes, colours) {
                                return true;
                            }
                        }
                        Colour::Black => {}
                    }
                }
            }
            colours.insert(node_id.clone(), Colour::Black);
            false
        }

        let mut colours: HashMap<NodeId, Colour> = HashMap::new();
        for node_id in &self.insertion {
            if colours.get(node_id).copied().unwrap_or(Colour::White) == Colour::White
                && visit(node_id, &self.nodes, &mut colours)
            {
                return true;
            }
        }
        false
    }

    /// Build a petgraph view of the structure
    fn build_graph(&self) -> (DiGraph<NodeId, ()>, HashMap<NodeId, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for node_id in &self.insertion {
            let idx = graph.add_node(node_id.clone());
            index.insert(node_id.clone(), idx);
        }
        for edge in &self.edges {
            if let (Some(&from), Some(&to)) = (index.get(&edge.source), index.get(&edge.target)) {
                graph.add_edge(from, to, ());
            }
        }
        (graph, index)
    }

    /// Longest dependency chain, by BFS from the roots
    fn max_depth(&self) -> usize {
        let (graph, _) = self.build_graph();
        let mut depths: HashMap<NodeIndex, usize> = HashMap::new();
        let mut queue = VecDeque::new();

        for node in graph.node_indices() {
            if graph.edges_directed(node, Direction::Incoming).count() == 0 {
                depths.insert(node, 0);
                queue.push_back((node, 0));
            }
        }

        let mut max_depth = 0;
        while let Some((node, depth)) = queue.pop_front() {
            max_depth = max_depth.max(depth);
            for edge in graph.edges_directed(node, Direction::Outgoing) {
                let target = edge.target();
                let next = depth + 1;
                if depths.get(&target).map_or(true, |&d| d < next) {
                    depths.insert(target, next);
                    queue.push_back((target, next));
                }
            }
        }
        max_depth
    }

    /// Kahn topological order; within a tier, ties break by priority then
    /// insertion order. Cached until the next structural mutation.
    pub fn execution_order(&mut self) -> Result<Vec<NodeId>> {
        if let Some(cached) = &self.topo_cache {
            return Ok(cached.clone());
        }

        let insertion_rank: HashMap<&NodeId, usize> = self
            .insertion
            .iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();

        let mut in_degree: HashMap<NodeId, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.dependencies.len()))
            .collect();

        let mut ready: Vec<NodeId> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(id, _)| id.clone())
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while !ready.is_empty() {
            ready.sort_by_key(|id| {
                (
                    self.nodes[id].priority.ordinal(),
                    insertion_rank.get(id).copied().unwrap_or(usize::MAX),
                )
            });
            let node_id = ready.remove(0);
            for dependent in &self.nodes[&node_id].dependents {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(dependent.clone());
                    }
                }
            }
            order.push(node_id);
        }

        if order.len() != self.nodes.len() {
            return Err(Error::CycleDetected(self.id.clone()));
        }

        self.topo_cache = Some(order.clone());
        Ok(order)
    }

    /// PENDING nodes whose dependencies are all satisfied, highest priority
    /// first. A COMPLETED dependency always satisfies; a SKIPPED one
    /// satisfies when `skipped_satisfies` is set.
    pub fn ready_nodes(&self, skipped_satisfies: bool) -> Vec<NodeId> {
        let satisfied = |dep: &NodeId| {
            self.nodes.get(dep).map_or(false, |node| {
                node.status == TaskStatus::Completed
                    || (skipped_satisfies && node.status == TaskStatus::Skipped)
            })
        };

        let insertion_rank: HashMap<&NodeId, usize> = self
            .insertion
            .iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();

        let mut ready: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|node| node.status == TaskStatus::Pending)
            .filter(|node| node.dependencies.iter().all(satisfied))
            .map(|node| node.id.clone())
            .collect();

        ready.sort_by_key(|id| {
            (
                self.nodes[id].priority.ordinal(),
                insertion_rank.get(id).copied().unwrap_or(usize::MAX),
            )
        });
        ready
    }

    /// Transitive dependents of a node
    pub fn descendants(&self, node_id: &str) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<NodeId> = self
            .nodes
            .get(node_id)
            .map(|n| n.dependents.iter().cloned().collect())
            .unwrap_or_default();

        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                if let Some(node) = self.nodes.get(&next) {
                    stack.extend(node.dependents.iter().cloned());
                }
            }
        }
        seen
    }

    /// Node counts by status
    pub fn status_counts(&self) -> HashMap<&'static str, usize> {
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for node in self.nodes.values() {
            *counts.entry(node.status.as_str()).or_default() += 1;
        }
        counts
    }

    /// Depth level per node: `1 + max(level(dep))`, roots at 0
    pub fn levels(&self) -> HashMap<NodeId, usize> {
        fn level_of(
            node_id: &NodeId,
            nodes: &HashMap<NodeId, DagNode>,
            levels: &mut HashMap<NodeId, usize>,
        ) -> usize {
            if let Some(&level) = levels.get(node_id) {
                return level;
            }
            let level = match nodes.get(node_id) {
                Some(node) if !node.dependencies.is_empty() => {
                    1 + node
                        .dependencies
                        .iter()
                        .map(|dep| level_of(dep, nodes, levels))
                        .max()
                        .unwrap_or(0)
                }
                _ => 0,
            };
            levels.insert(node_id.clone(), level);
            level
        }

        let mut levels = HashMap::new();
        for node_id in &self.insertion {
            level_of(node_id, &self.nodes, &mut levels);
        }
        levels
    }

    /// Assign grid coordinates for visual export; non-semantic
    pub fn auto_layout(&mut self) {
        const NODE_WIDTH: f64 = 200.0;
        const NODE_HEIGHT: f64 = 100.0;
        const START_X: f64 = 100.0;
        const START_Y: f64 = 100.0;

        let levels = self.levels();
        let mut by_level: HashMap<usize, Vec<NodeId>> = HashMap::new();
        for node_id in &self.insertion {
            let level = levels.get(node_id).copied().unwrap_or(0);
            by_level.entry(level).or_default().push(node_id.clone());
        }

        for (level, node_ids) in by_level {
            let y = START_Y + level as f64 * NODE_HEIGHT;
            let total_width = node_ids.len() as f64 * NODE_WIDTH;
            let left = START_X - total_width / 2.0;
            for (i, node_id) in node_ids.iter().enumerate() {
                if let Some(node) = self.nodes.get_mut(node_id) {
                    node.position = Position {
                        x: left + i as f64 * NODE_WIDTH + NODE_WIDTH / 2.0,
                        y,
                    };
                }
            }
        }
    }

    /// Export to a Mermaid diagram
    pub fn to_mermaid(&self) -> String {
        let mut lines = vec!["graph TD".to_string()];

        for node in self.nodes() {
            let class = match node.status {
                TaskStatus::Running => ":::running",
                TaskStatus::Completed => ":::completed",
                TaskStatus::Failed => ":::failed",
                TaskStatus::Cancelled => ":::cancelled",
                TaskStatus::Skipped => ":::skipped",
                _ => "",
            };
            lines.push(format!("    {}[\"{}\"]{}", node.id, node.name, class));
        }

        for edge in &self.edges {
            let label = if edge.label.is_empty() {
                String::new()
            } else {
                format!("|{}|", edge.label)
            };
            lines.push(format!("    {} -->{} {}", edge.source, label, edge.target));
        }

        lines.push(String::new());
        lines.push("    classDef running fill:#1890ff,color:#fff".to_string());
        lines.push("    classDef completed fill:#52c41a,color:#fff".to_string());
        lines.push("    classDef failed fill:#ff4d4f,color:#fff".to_string());
        lines.push("    classDef cancelled fill:#d9d9d9,color:#666".to_string());
        lines.push("    classDef skipped fill:#d9d9d9,color:#666".to_string());

        lines.join("\n")
    }
}

/// Fluent builder for DAGs.
///
/// ```ignore
/// let dag = DagBuilder::new("daily_collection")
///     .add_task("preload", "Preload Companies", "company_preload")
///     .add_task("klines", "Collect K-lines", "kline_collection")
///     .depends_on(["preload"])
///     .build()?;
/// ```
pub struct DagBuilder {
    name: String,
    description: String,
    nodes: Vec<DagNode>,
}

impl DagBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            nodes: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a task node; subsequent modifiers apply to it
    pub fn add_task(
        mut self,
        id: impl Into<NodeId>,
        name: impl Into<String>,
        task_type: impl Into<String>,
    ) -> Self {
        self.nodes.push(DagNode::new(id, name, task_type));
        self
    }

    pub fn params(mut self, params: ValueMap) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            node.params = params;
        }
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            node.priority = priority;
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            node.timeout = timeout;
        }
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            node.max_retries = max_retries;
        }
        self
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        if let Some(node) = self.nodes.last_mut() {
            node.dependencies
                .extend(dependencies.into_iter().map(Into::into));
        }
        self
    }

    /// Assemble and validate the DAG
    pub fn build(self) -> Result<Dag> {
        let mut dag = Dag::new(self.name).with_description(self.description);
        for node in self.nodes {
            dag.add_node(node)?;
        }
        dag.ensure_valid()?;
        Ok(dag)
    }
}
