use crate::ast::{
    BinaryOperator, Expression, Literal, PathElement, Pattern, SortDirection, Traversal,
    UnaryOperator,
};
use crate::error::{Error, Result};
use crate::planner::{
    Aggregate, ColumnKind, ExpandDirection, ExpandNode, ExpandVariableNode, NodeSpec, Predicate,
    ProjectionPlan, QueryPlan, SeedNode, Stage,
};
use ordered_float::OrderedFloat;
use rserv_api::{GraphView, NodeKey};
use serde::ser::SerializeMap;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Instant;

/// Runtime value domain. Numbers keep their integer-ness where possible;
/// nodes materialise as flat maps of their properties plus `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    fn truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// One result row: named columns in projection order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new(columns: Vec<(String, Value)>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[(String, Value)] {
        &self.columns
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, value) in &self.columns {
            map.insert(name.clone(), value.to_json());
        }
        serde_json::Value::Object(map)
    }
}

impl serde::Serialize for Row {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Orderable, hash-free grouping key. Ints and floats collapse into one
/// numeric axis so `1` groups with `1.0`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum GroupKey {
    Null,
    Bool(bool),
    Num(OrderedFloat<f64>),
    Str(String),
    List(Vec<GroupKey>),
    Map(Vec<(String, GroupKey)>),
}

fn group_key(value: &Value) -> GroupKey {
    match value {
        Value::Null => GroupKey::Null,
        Value::Bool(b) => GroupKey::Bool(*b),
        Value::Int(i) => GroupKey::Num(OrderedFloat(*i as f64)),
        Value::Float(f) => GroupKey::Num(OrderedFloat(*f)),
        Value::String(s) => GroupKey::Str(s.clone()),
        Value::List(items) => GroupKey::List(items.iter().map(group_key).collect()),
        Value::Map(map) => GroupKey::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), group_key(v)))
                .collect(),
        ),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecOptions {
    pub max_depth: u32,
    pub deadline: Option<Instant>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            max_depth: 10,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    pub rows: Vec<Row>,
    pub nodes_visited: u64,
}

type Binding = BTreeMap<String, NodeKey>;

enum Env<'a> {
    Binding(&'a Binding),
    Row(&'a Row),
    /// Row columns first, pattern bindings as fallback (ORDER BY).
    RowWithBinding(&'a Row, &'a Binding),
}

pub struct Executor<'a> {
    view: &'a dyn GraphView,
    opts: ExecOptions,
    nodes_visited: u64,
}

/// Case-insensitive type match with singular/plural tolerance, mirroring
/// the entity-name normalisation at the index side.
fn types_match(a: &str, b: &str) -> bool {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    a == b || a.strip_suffix('s') == Some(b.as_str()) || b.strip_suffix('s') == Some(a.as_str())
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::String(s) => Value::String(s.clone()),
        Literal::Number(n) => {
            if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                Value::Int(*n as i64)
            } else {
                Value::Float(*n)
            }
        }
        Literal::Boolean(b) => Value::Bool(*b),
        Literal::Null => Value::Null,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            a.as_f64() == b.as_f64()
        }
        _ => a == b,
    }
}

impl<'a> Executor<'a> {
    pub fn new(view: &'a dyn GraphView, opts: ExecOptions) -> Self {
        Self {
            view,
            opts,
            nodes_visited: 0,
        }
    }

    pub fn execute(mut self, plan: &QueryPlan) -> Result<QueryOutput> {
        let mut bindings: Vec<Binding> = vec![Binding::new()];
        let mut bound: BTreeSet<String> = BTreeSet::new();
        let mut applied: Vec<bool> = vec![false; plan.predicates.len()];

        for stage in &plan.stages {
            self.check_deadline()?;
            bindings = match stage {
                Stage::Seed(seed) => {
                    bound.insert(seed.spec.var.clone());
                    self.seed(bindings, seed)?
                }
                Stage::Expand(node) => {
                    bound.insert(node.to.var.clone());
                    self.expand(bindings, node)?
                }
                Stage::ExpandVariable(node) => {
                    bound.insert(node.to.var.clone());
                    self.expand_variable(bindings, node, plan.traversal)?
                }
            };
            bindings = self.apply_ready_predicates(bindings, plan, &bound, &mut applied)?;
        }

        let rows = if let Some(with) = &plan.with {
            let intermediate = self.project_bindings(with, &bindings)?;
            let final_rows = self.project_rows(&plan.ret, &intermediate)?;
            self.order_and_limit(final_rows, None, plan)?
        } else if plan.ret.has_aggregates {
            let rows = self.project_bindings(&plan.ret, &bindings)?;
            self.order_and_limit(rows, None, plan)?
        } else {
            let rows = self.project_bindings(&plan.ret, &bindings)?;
            self.order_and_limit(rows, Some(&bindings), plan)?
        };

        Ok(QueryOutput {
            rows,
            nodes_visited: self.nodes_visited,
        })
    }

    fn check_deadline(&self) -> Result<()> {
        if let Some(deadline) = self.opts.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }

    fn node_matches(&self, spec: &NodeSpec, node: NodeKey) -> bool {
        if let Some(label) = &spec.label {
            match self.view.node_type(node) {
                Some(ty) if types_match(&ty, label) => {}
                _ => return false,
            }
        }
        for (key, literal) in &spec.props {
            let want = literal_value(literal);
            match self.view.node_property(node, key) {
                Some(actual) if values_equal(&Value::from_json(&actual), &want) => {}
                _ => return false,
            }
        }
        true
    }

    fn seed(&mut self, bindings: Vec<Binding>, seed: &SeedNode) -> Result<Vec<Binding>> {
        let spec = &seed.spec;
        let indexed = match (&spec.label, &seed.eq) {
            (Some(label), Some((field, literal))) => {
                self.view
                    .seed_by_property(label, field, &literal_value(literal).to_json())
            }
            _ => None,
        };
        let candidates = match indexed {
            Some(nodes) => nodes,
            None => match &spec.label {
                Some(label) => self.view.nodes_of_type(label),
                None => self.view.nodes(),
            },
        };

        let mut out = Vec::new();
        for binding in &bindings {
            self.check_deadline()?;
            for node in &candidates {
                self.nodes_visited += 1;
                if !self.node_matches(spec, *node) {
                    continue;
                }
                if let Some((field, literal)) = &seed.eq {
                    let want = literal_value(literal);
                    match self.view.node_property(*node, field) {
                        Some(actual) if values_equal(&Value::from_json(&actual), &want) => {}
                        _ => continue,
                    }
                }
                let mut next = binding.clone();
                next.insert(spec.var.clone(), *node);
                out.push(next);
            }
        }
        Ok(out)
    }

    fn neighbors(&self, node: NodeKey, direction: ExpandDirection) -> Vec<rserv_api::Edge> {
        match direction {
            ExpandDirection::Out => self.view.outbound(node),
            ExpandDirection::In => self.view.inbound(node),
        }
    }

    fn expand(&mut self, bindings: Vec<Binding>, node: &ExpandNode) -> Result<Vec<Binding>> {
        let mut out = Vec::new();
        if !node.edge_props_empty {
            return Ok(out);
        }
        for binding in bindings {
            self.check_deadline()?;
            let Some(src) = binding.get(&node.from).copied() else {
                continue;
            };
            for edge in self.neighbors(src, node.direction) {
                self.nodes_visited += 1;
                if !node.labels.is_empty() && !node.labels.contains(&edge.label) {
                    continue;
                }
                if !self.node_matches(&node.to, edge.peer) {
                    continue;
                }
                match binding.get(&node.to.var) {
                    Some(existing) if *existing != edge.peer => continue,
                    Some(_) => out.push(binding.clone()),
                    None => {
                        let mut next = binding.clone();
                        next.insert(node.to.var.clone(), edge.peer);
                        out.push(next);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Walks `*min..max` ranges path by path; a node is never revisited
    /// within one walk, and the overall depth is capped by `max_depth`.
    fn var_length_targets(
        &mut self,
        src: NodeKey,
        labels: &[String],
        direction: ExpandDirection,
        min: u32,
        max: Option<u32>,
        traversal: Traversal,
    ) -> Result<Vec<NodeKey>> {
        let cap = max.unwrap_or(self.opts.max_depth).min(self.opts.max_depth);
        let mut targets = Vec::new();
        let mut frontier: VecDeque<(NodeKey, u32, BTreeSet<NodeKey>)> = VecDeque::new();
        frontier.push_back((src, 0, BTreeSet::from([src])));

        while let Some((node, depth, visited)) = match traversal {
            Traversal::Bfs => frontier.pop_front(),
            Traversal::Dfs => frontier.pop_back(),
        } {
            self.check_deadline()?;
            if depth >= min {
                targets.push(node);
            }
            if depth >= cap {
                continue;
            }
            let edges = self.neighbors(node, direction);
            let next = edges.into_iter().filter(|edge| {
                (labels.is_empty() || labels.contains(&edge.label)) && !visited.contains(&edge.peer)
            });
            let step = |edge: rserv_api::Edge| {
                let mut seen = visited.clone();
                seen.insert(edge.peer);
                (edge.peer, depth + 1, seen)
            };
            match traversal {
                Traversal::Bfs => {
                    for edge in next {
                        self.nodes_visited += 1;
                        frontier.push_back(step(edge));
                    }
                }
                Traversal::Dfs => {
                    // Reversed push keeps adjacency order on pop.
                    let mut batch: Vec<_> = next.collect();
                    batch.reverse();
                    for edge in batch {
                        self.nodes_visited += 1;
                        frontier.push_back(step(edge));
                    }
                }
            }
        }
        Ok(targets)
    }

    fn expand_variable(
        &mut self,
        bindings: Vec<Binding>,
        node: &ExpandVariableNode,
        traversal: Traversal,
    ) -> Result<Vec<Binding>> {
        let mut out = Vec::new();
        if !node.edge_props_empty {
            return Ok(out);
        }
        for binding in bindings {
            let Some(src) = binding.get(&node.from).copied() else {
                continue;
            };
            let targets = self.var_length_targets(
                src,
                &node.labels,
                node.direction,
                node.min,
                node.max,
                traversal,
            )?;
            for peer in targets {
                if !self.node_matches(&node.to, peer) {
                    continue;
                }
                match binding.get(&node.to.var) {
                    Some(existing) if *existing != peer => continue,
                    Some(_) => out.push(binding.clone()),
                    None => {
                        let mut next = binding.clone();
                        next.insert(node.to.var.clone(), peer);
                        out.push(next);
                    }
                }
            }
        }
        Ok(out)
    }

    fn apply_ready_predicates(
        &mut self,
        mut bindings: Vec<Binding>,
        plan: &QueryPlan,
        bound: &BTreeSet<String>,
        applied: &mut [bool],
    ) -> Result<Vec<Binding>> {
        for (idx, predicate) in plan.predicates.iter().enumerate() {
            if applied[idx] || !predicate.variables.iter().all(|v| bound.contains(v)) {
                continue;
            }
            applied[idx] = true;
            let mut kept = Vec::new();
            for binding in bindings {
                let value = self.eval(&predicate.expression, &Env::Binding(&binding))?;
                if value.truthy() {
                    kept.push(binding);
                }
            }
            bindings = kept;
        }
        Ok(bindings)
    }

    fn materialize(&self, node: NodeKey) -> Value {
        let mut map: BTreeMap<String, Value> = self
            .view
            .node_properties(node)
            .map(|props| {
                props
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(ty) = self.view.node_type(node) {
            map.insert("type".to_string(), Value::String(ty));
        }
        map.entry("id".to_string())
            .or_insert(Value::Int(node.id as i64));
        Value::Map(map)
    }

    fn eval(&self, expr: &Expression, env: &Env<'_>) -> Result<Value> {
        match expr {
            Expression::Literal(literal) => Ok(literal_value(literal)),
            Expression::Variable(name) => Ok(self.lookup_variable(name, env)),
            Expression::Property(access) => Ok(self.lookup_property(access.variable.as_str(), &access.property, env)),
            Expression::Binary(binary) => {
                match binary.operator {
                    BinaryOperator::And => {
                        let left = self.eval(&binary.left, env)?;
                        if !left.truthy() {
                            return Ok(Value::Bool(false));
                        }
                        let right = self.eval(&binary.right, env)?;
                        return Ok(Value::Bool(right.truthy()));
                    }
                    BinaryOperator::Or => {
                        let left = self.eval(&binary.left, env)?;
                        if left.truthy() {
                            return Ok(Value::Bool(true));
                        }
                        let right = self.eval(&binary.right, env)?;
                        return Ok(Value::Bool(right.truthy()));
                    }
                    _ => {}
                }
                let left = self.eval(&binary.left, env)?;
                let right = self.eval(&binary.right, env)?;
                match binary.operator {
                    BinaryOperator::Equals => Ok(Value::Bool(values_equal(&left, &right))),
                    BinaryOperator::NotEquals => Ok(Value::Bool(!values_equal(&left, &right))),
                    op => {
                        if matches!(left, Value::Null) || matches!(right, Value::Null) {
                            return Ok(Value::Bool(false));
                        }
                        let ordering = compare_ordered(&left, &right)?;
                        let result = match op {
                            BinaryOperator::LessThan => ordering.is_lt(),
                            BinaryOperator::LessEqual => ordering.is_le(),
                            BinaryOperator::GreaterThan => ordering.is_gt(),
                            BinaryOperator::GreaterEqual => ordering.is_ge(),
                            _ => unreachable!(),
                        };
                        Ok(Value::Bool(result))
                    }
                }
            }
            Expression::Unary(unary) => {
                let value = self.eval(&unary.operand, env)?;
                match unary.operator {
                    UnaryOperator::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOperator::Negate => match value {
                        Value::Int(i) => Ok(Value::Int(-i)),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(Error::Runtime(format!(
                            "cannot negate non-numeric value {other:?}"
                        ))),
                    },
                }
            }
            Expression::FunctionCall(call) => {
                if call.name.eq_ignore_ascii_case("exists") {
                    let arg = call.args.first().ok_or_else(|| {
                        Error::Runtime("EXISTS requires an argument".to_string())
                    })?;
                    let value = self.eval(arg, env)?;
                    return Ok(Value::Bool(!matches!(value, Value::Null)));
                }
                Err(Error::Runtime(format!(
                    "function {} is not valid here",
                    call.name
                )))
            }
            Expression::PatternExists(pattern) => match env {
                Env::Binding(binding) => {
                    Ok(Value::Bool(self.pattern_exists(binding, pattern)?))
                }
                _ => Err(Error::Runtime(
                    "pattern predicate outside of MATCH scope".to_string(),
                )),
            },
        }
    }

    fn lookup_variable(&self, name: &str, env: &Env<'_>) -> Value {
        match env {
            Env::Binding(binding) => binding
                .get(name)
                .map(|node| self.materialize(*node))
                .unwrap_or(Value::Null),
            Env::Row(row) => row.get(name).cloned().unwrap_or(Value::Null),
            Env::RowWithBinding(row, binding) => row
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.lookup_variable(name, &Env::Binding(binding))),
        }
    }

    fn lookup_property(&self, variable: &str, property: &str, env: &Env<'_>) -> Value {
        match env {
            Env::Binding(binding) => binding
                .get(variable)
                .and_then(|node| self.view.node_property(*node, property))
                .map(|v| Value::from_json(&v))
                .unwrap_or(Value::Null),
            Env::Row(row) => {
                let qualified = format!("{variable}.{property}");
                if let Some(value) = row.get(&qualified) {
                    return value.clone();
                }
                match row.get(variable) {
                    Some(Value::Map(map)) => map.get(property).cloned().unwrap_or(Value::Null),
                    _ => Value::Null,
                }
            }
            Env::RowWithBinding(row, binding) => {
                let from_row = self.lookup_property(variable, property, &Env::Row(row));
                if matches!(from_row, Value::Null) {
                    self.lookup_property(variable, property, &Env::Binding(binding))
                } else {
                    from_row
                }
            }
        }
    }

    /// Existence check for a pattern anchored on already-bound variables.
    /// Intermediate variables are local wildcards.
    fn pattern_exists(&self, binding: &Binding, pattern: &Pattern) -> Result<bool> {
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        for element in &pattern.elements {
            match element {
                PathElement::Node(n) => nodes.push(n),
                PathElement::Edge(e) => edges.push(e),
            }
        }
        if nodes.is_empty() {
            return Ok(false);
        }

        let anchored = |idx: usize| -> Option<NodeKey> {
            nodes[idx]
                .variable
                .as_ref()
                .and_then(|var| binding.get(var).copied())
        };
        let matches_local = |idx: usize, node: NodeKey| -> bool {
            if let Some(required) = anchored(idx) {
                if required != node {
                    return false;
                }
            }
            let spec = NodeSpec {
                var: String::new(),
                label: nodes[idx].label.clone(),
                props: nodes[idx]
                    .properties
                    .iter()
                    .map(|p| (p.key.clone(), p.value.clone()))
                    .collect(),
            };
            self.node_matches(&spec, node)
        };

        let mut current: Vec<NodeKey> = match anchored(0) {
            Some(node) => {
                if matches_local(0, node) {
                    vec![node]
                } else {
                    Vec::new()
                }
            }
            None => self
                .view
                .nodes()
                .into_iter()
                .filter(|n| matches_local(0, *n))
                .collect(),
        };

        for (idx, edge) in edges.iter().enumerate() {
            if current.is_empty() {
                return Ok(false);
            }
            if !edge.properties.is_empty() {
                return Ok(false);
            }
            let labels: Vec<String> = edge.labels.iter().map(|l| l.to_uppercase()).collect();
            let mut next = BTreeSet::new();
            for src in current {
                for out in self.view.outbound(src) {
                    if !labels.is_empty() && !labels.contains(&out.label) {
                        continue;
                    }
                    if matches_local(idx + 1, out.peer) {
                        next.insert(out.peer);
                    }
                }
            }
            current = next.into_iter().collect();
        }
        Ok(!current.is_empty())
    }

    fn project_bindings(
        &mut self,
        plan: &ProjectionPlan,
        bindings: &[Binding],
    ) -> Result<Vec<Row>> {
        if plan.has_aggregates {
            self.aggregate_project(plan, bindings.iter().map(Env::Binding))
        } else {
            let mut rows = Vec::with_capacity(bindings.len());
            for binding in bindings {
                self.check_deadline()?;
                rows.push(self.plain_row(plan, &Env::Binding(binding))?);
            }
            Ok(rows)
        }
    }

    fn project_rows(&mut self, plan: &ProjectionPlan, rows: &[Row]) -> Result<Vec<Row>> {
        if plan.has_aggregates {
            self.aggregate_project(plan, rows.iter().map(Env::Row))
        } else {
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                self.check_deadline()?;
                out.push(self.plain_row(plan, &Env::Row(row))?);
            }
            Ok(out)
        }
    }

    fn plain_row(&self, plan: &ProjectionPlan, env: &Env<'_>) -> Result<Row> {
        let mut columns = Vec::with_capacity(plan.columns.len());
        for column in &plan.columns {
            let ColumnKind::Value(expr) = &column.kind else {
                unreachable!("aggregate column in plain projection");
            };
            columns.push((column.alias.clone(), self.eval(expr, env)?));
        }
        Ok(Row::new(columns))
    }

    /// SQL grouping semantics: the non-aggregate columns form the group
    /// key; groups appear in first-seen order.
    fn aggregate_project<'e>(
        &self,
        plan: &ProjectionPlan,
        envs: impl Iterator<Item = Env<'e>>,
    ) -> Result<Vec<Row>> {
        let mut order: Vec<Vec<GroupKey>> = Vec::new();
        let mut groups: BTreeMap<Vec<GroupKey>, (Vec<Value>, Vec<Accum>)> = BTreeMap::new();

        for env in envs {
            let mut key = Vec::new();
            let mut key_values = Vec::new();
            for column in &plan.columns {
                if let ColumnKind::Value(expr) = &column.kind {
                    let value = self.eval(expr, &env)?;
                    key.push(group_key(&value));
                    key_values.push(value);
                }
            }
            let entry = groups.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                let accums = plan
                    .columns
                    .iter()
                    .filter_map(|c| match &c.kind {
                        ColumnKind::Aggregate(aggregate) => Some(Accum::new(aggregate)),
                        ColumnKind::Value(_) => None,
                    })
                    .collect();
                (key_values, accums)
            });
            let mut slot = 0;
            for column in &plan.columns {
                if let ColumnKind::Aggregate(aggregate) = &column.kind {
                    let value = match aggregate_input(aggregate) {
                        Some(expr) => Some(self.eval(expr, &env)?),
                        None => None,
                    };
                    entry.1[slot].push(value)?;
                    slot += 1;
                }
            }
        }

        // An aggregate query with no group columns still yields one row.
        if order.is_empty() && plan.columns.iter().all(|c| matches!(c.kind, ColumnKind::Aggregate(_))) {
            let accums: Vec<Accum> = plan
                .columns
                .iter()
                .filter_map(|c| match &c.kind {
                    ColumnKind::Aggregate(aggregate) => Some(Accum::new(aggregate)),
                    ColumnKind::Value(_) => None,
                })
                .collect();
            order.push(Vec::new());
            groups.insert(Vec::new(), (Vec::new(), accums));
        }

        let mut rows = Vec::with_capacity(order.len());
        for key in order {
            let (key_values, accums) = groups.remove(&key).expect("group recorded");
            let mut columns = Vec::with_capacity(plan.columns.len());
            let mut value_idx = 0;
            let mut accum_idx = 0;
            for column in &plan.columns {
                let value = match &column.kind {
                    ColumnKind::Value(_) => {
                        let v = key_values[value_idx].clone();
                        value_idx += 1;
                        v
                    }
                    ColumnKind::Aggregate(_) => {
                        let v = accums[accum_idx].finish();
                        accum_idx += 1;
                        v
                    }
                };
                columns.push((column.alias.clone(), value));
            }
            rows.push(Row::new(columns));
        }
        Ok(rows)
    }

    fn order_and_limit(
        &mut self,
        rows: Vec<Row>,
        bindings: Option<&[Binding]>,
        plan: &QueryPlan,
    ) -> Result<Vec<Row>> {
        let mut rows = rows;
        if !plan.order_by.is_empty() {
            let mut keyed: Vec<(Vec<GroupKey>, Row)> = Vec::with_capacity(rows.len());
            for (idx, row) in rows.into_iter().enumerate() {
                let mut keys = Vec::with_capacity(plan.order_by.len());
                for item in &plan.order_by {
                    let env = match bindings.and_then(|b| b.get(idx)) {
                        Some(binding) => Env::RowWithBinding(&row, binding),
                        None => Env::Row(&row),
                    };
                    keys.push(group_key(&self.eval(&item.expression, &env)?));
                }
                keyed.push((keys, row));
            }
            keyed.sort_by(|(a, _), (b, _)| {
                for (item, (ka, kb)) in plan.order_by.iter().zip(a.iter().zip(b.iter())) {
                    let cmp = ka.cmp(kb);
                    if cmp != std::cmp::Ordering::Equal {
                        return match item.direction {
                            SortDirection::Ascending => cmp,
                            SortDirection::Descending => cmp.reverse(),
                        };
                    }
                }
                std::cmp::Ordering::Equal
            });
            rows = keyed.into_iter().map(|(_, row)| row).collect();
        }
        if let Some(limit) = plan.limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }
}

fn compare_ordered(a: &Value, b: &Value) -> Result<std::cmp::Ordering> {
    match (a, b) {
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let (x, y) = (a.as_f64().unwrap(), b.as_f64().unwrap());
            Ok(OrderedFloat(x).cmp(&OrderedFloat(y)))
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        _ => Err(Error::Runtime(format!(
            "type mismatch in comparison: {a:?} vs {b:?}"
        ))),
    }
}

fn aggregate_input(aggregate: &Aggregate) -> Option<&Expression> {
    match aggregate {
        Aggregate::Count(arg) => arg.as_ref(),
        Aggregate::Sum(e)
        | Aggregate::Avg(e)
        | Aggregate::Min(e)
        | Aggregate::Max(e)
        | Aggregate::Distinct(e) => Some(e),
    }
}

/// Per-group accumulator state for one aggregate column.
#[derive(Debug, Clone)]
enum Accum {
    Count(u64, bool),
    Sum { total: f64, integral: bool },
    Avg { total: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    Distinct(BTreeMap<GroupKey, Value>),
}

impl Accum {
    fn new(aggregate: &Aggregate) -> Self {
        match aggregate {
            Aggregate::Count(arg) => Accum::Count(0, arg.is_some()),
            Aggregate::Sum(_) => Accum::Sum {
                total: 0.0,
                integral: true,
            },
            Aggregate::Avg(_) => Accum::Avg {
                total: 0.0,
                count: 0,
            },
            Aggregate::Min(_) => Accum::Min(None),
            Aggregate::Max(_) => Accum::Max(None),
            Aggregate::Distinct(_) => Accum::Distinct(BTreeMap::new()),
        }
    }

    fn push(&mut self, value: Option<Value>) -> Result<()> {
        match self {
            Accum::Count(count, counts_values) => {
                if !*counts_values || !matches!(value, Some(Value::Null) | None) {
                    *count += 1;
                }
            }
            Accum::Sum { total, integral } => {
                if let Some(value) = value {
                    if matches!(value, Value::Null) {
                        return Ok(());
                    }
                    let Some(n) = value.as_f64() else {
                        return Err(Error::Runtime(format!(
                            "SUM over non-numeric value {value:?}"
                        )));
                    };
                    if !matches!(value, Value::Int(_)) {
                        *integral = false;
                    }
                    *total += n;
                }
            }
            Accum::Avg { total, count } => {
                if let Some(value) = value {
                    if matches!(value, Value::Null) {
                        return Ok(());
                    }
                    let Some(n) = value.as_f64() else {
                        return Err(Error::Runtime(format!(
                            "AVG over non-numeric value {value:?}"
                        )));
                    };
                    *total += n;
                    *count += 1;
                }
            }
            Accum::Min(best) => {
                if let Some(value) = value {
                    if matches!(value, Value::Null) {
                        return Ok(());
                    }
                    let replace = match best {
                        Some(current) => group_key(&value) < group_key(current),
                        None => true,
                    };
                    if replace {
                        *best = Some(value);
                    }
                }
            }
            Accum::Max(best) => {
                if let Some(value) = value {
                    if matches!(value, Value::Null) {
                        return Ok(());
                    }
                    let replace = match best {
                        Some(current) => group_key(&value) > group_key(current),
                        None => true,
                    };
                    if replace {
                        *best = Some(value);
                    }
                }
            }
            Accum::Distinct(seen) => {
                if let Some(value) = value {
                    if !matches!(value, Value::Null) {
                        seen.entry(group_key(&value)).or_insert(value);
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&self) -> Value {
        match self {
            Accum::Count(count, _) => Value::Int(*count as i64),
            Accum::Sum { total, integral } => {
                if *integral {
                    Value::Int(*total as i64)
                } else {
                    Value::Float(*total)
                }
            }
            Accum::Avg { total, count } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Float(*total / *count as f64)
                }
            }
            Accum::Min(best) | Accum::Max(best) => best.clone().unwrap_or(Value::Null),
            Accum::Distinct(seen) => Value::List(seen.values().cloned().collect()),
        }
    }
}
