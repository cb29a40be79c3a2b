use crate::ast::*;
use crate::error::{Error, Result};
use std::collections::BTreeSet;

/// Binding-extension plan: a sequence of seed and expand stages, the
/// predicate set for pushdown, and the projection pipeline.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub traversal: Traversal,
    pub stages: Vec<Stage>,
    pub predicates: Vec<Predicate>,
    pub with: Option<ProjectionPlan>,
    pub ret: ProjectionPlan,
    pub order_by: Vec<OrderByItem>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone)]
pub enum Stage {
    Seed(SeedNode),
    Expand(ExpandNode),
    ExpandVariable(ExpandVariableNode),
}

#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub var: String,
    pub label: Option<String>,
    pub props: Vec<(String, Literal)>,
}

#[derive(Debug, Clone)]
pub struct SeedNode {
    pub spec: NodeSpec,
    /// Property-equality constraint lifted from WHERE, used for indexed
    /// seed lookup.
    pub eq: Option<(String, Literal)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpandDirection {
    Out,
    In,
}

#[derive(Debug, Clone)]
pub struct ExpandNode {
    pub from: String,
    pub to: NodeSpec,
    pub labels: Vec<String>,
    pub direction: ExpandDirection,
    /// Edges carry no payload; a non-empty property spec matches nothing.
    pub edge_props_empty: bool,
}

#[derive(Debug, Clone)]
pub struct ExpandVariableNode {
    pub from: String,
    pub to: NodeSpec,
    pub labels: Vec<String>,
    pub direction: ExpandDirection,
    pub min: u32,
    pub max: Option<u32>,
    pub edge_props_empty: bool,
}

/// A WHERE conjunct, applied as soon as every variable it mentions is
/// bound.
#[derive(Debug, Clone)]
pub struct Predicate {
    pub expression: Expression,
    pub variables: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProjectionPlan {
    pub columns: Vec<ColumnPlan>,
    pub has_aggregates: bool,
}

#[derive(Debug, Clone)]
pub struct ColumnPlan {
    pub alias: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone)]
pub enum ColumnKind {
    Value(Expression),
    Aggregate(Aggregate),
}

#[derive(Debug, Clone)]
pub enum Aggregate {
    Count(Option<Expression>),
    Sum(Expression),
    Avg(Expression),
    Min(Expression),
    Max(Expression),
    Distinct(Expression),
}

pub struct QueryPlanner {
    anon: u32,
}

impl Default for QueryPlanner {
    fn default() -> Self {
        Self::new()
    }
}

struct Chain {
    nodes: Vec<NodeSpec>,
    edges: Vec<EdgePattern>,
}

impl QueryPlanner {
    pub fn new() -> Self {
        Self { anon: 0 }
    }

    pub fn plan(&mut self, query: Query) -> Result<QueryPlan> {
        let mut chains = Vec::new();
        let mut predicates = Vec::new();

        for clause in &query.matches {
            chains.push(self.build_chain(&clause.pattern)?);
            if let Some(expr) = &clause.where_clause {
                split_conjuncts(expr, &mut predicates);
            }
        }

        let mut bound: BTreeSet<String> = BTreeSet::new();
        let mut stages = Vec::new();
        for chain in &chains {
            self.plan_chain(chain, &predicates, &mut bound, &mut stages)?;
        }

        for predicate in &predicates {
            for var in &predicate.variables {
                if !bound.contains(var) {
                    return Err(Error::Runtime(format!("unresolvable variable {var}")));
                }
            }
        }

        let with = match &query.with {
            Some(projection) => Some(plan_projection(projection, &bound, None)?),
            None => None,
        };
        let ret_scope = match &with {
            Some(plan) => Some(plan),
            None => None,
        };
        let ret = plan_projection(&query.ret, &bound, ret_scope)?;

        Ok(QueryPlan {
            traversal: query.traversal,
            stages,
            predicates,
            with,
            ret,
            order_by: query.order_by.map(|o| o.items).unwrap_or_default(),
            limit: query.limit,
        })
    }

    fn fresh_var(&mut self) -> String {
        self.anon += 1;
        format!("_anon{}", self.anon)
    }

    fn build_chain(&mut self, pattern: &Pattern) -> Result<Chain> {
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        for element in &pattern.elements {
            match element {
                PathElement::Node(node) => nodes.push(NodeSpec {
                    var: node.variable.clone().unwrap_or_else(|| self.fresh_var()),
                    label: node.label.clone(),
                    props: node
                        .properties
                        .iter()
                        .map(|p| (p.key.clone(), p.value.clone()))
                        .collect(),
                }),
                PathElement::Edge(edge) => edges.push(edge.clone()),
            }
        }
        Ok(Chain { nodes, edges })
    }

    /// Lays out one chain: pick a seed (unless a variable is already
    /// bound), then expand rightwards over outbound edges and leftwards
    /// over inbound edges.
    fn plan_chain(
        &mut self,
        chain: &Chain,
        predicates: &[Predicate],
        bound: &mut BTreeSet<String>,
        stages: &mut Vec<Stage>,
    ) -> Result<()> {
        let start = match chain.nodes.iter().position(|n| bound.contains(&n.var)) {
            Some(idx) => idx,
            None => {
                let idx = seed_index(chain, predicates);
                let spec = chain.nodes[idx].clone();
                let eq = seed_equality(&spec.var, predicates);
                bound.insert(spec.var.clone());
                stages.push(Stage::Seed(SeedNode { spec, eq }));
                idx
            }
        };

        for i in start..chain.edges.len() {
            let stage = expand_stage(
                &chain.nodes[i].var,
                &chain.edges[i],
                chain.nodes[i + 1].clone(),
                ExpandDirection::Out,
            );
            bound.insert(chain.nodes[i + 1].var.clone());
            stages.push(stage);
        }
        for i in (0..start).rev() {
            let stage = expand_stage(
                &chain.nodes[i + 1].var,
                &chain.edges[i],
                chain.nodes[i].clone(),
                ExpandDirection::In,
            );
            bound.insert(chain.nodes[i].var.clone());
            stages.push(stage);
        }
        Ok(())
    }
}

fn expand_stage(
    from: &str,
    edge: &EdgePattern,
    to: NodeSpec,
    direction: ExpandDirection,
) -> Stage {
    let labels: Vec<String> = edge.labels.iter().map(|l| l.to_uppercase()).collect();
    let edge_props_empty = edge.properties.is_empty();
    match edge.range {
        Some(range) => Stage::ExpandVariable(ExpandVariableNode {
            from: from.to_string(),
            to,
            labels,
            direction,
            min: range.min.unwrap_or(1),
            max: range.max,
            edge_props_empty,
        }),
        None => Stage::Expand(ExpandNode {
            from: from.to_string(),
            to,
            labels,
            direction,
            edge_props_empty,
        }),
    }
}

/// Seed scoring: WHERE-equality on a node's property beats a literal type
/// plus inline properties, which beats a bare type, which beats position.
fn seed_index(chain: &Chain, predicates: &[Predicate]) -> usize {
    let mut best = 0;
    let mut best_score = -1i32;
    for (idx, node) in chain.nodes.iter().enumerate() {
        let score = if seed_equality(&node.var, predicates).is_some() {
            3
        } else if node.label.is_some() && !node.props.is_empty() {
            2
        } else if node.label.is_some() {
            1
        } else {
            0
        };
        if score > best_score {
            best_score = score;
            best = idx;
        }
    }
    best
}

/// `var.field = literal` (either side) lifted out of the WHERE conjuncts.
fn seed_equality(var: &str, predicates: &[Predicate]) -> Option<(String, Literal)> {
    for predicate in predicates {
        let Expression::Binary(binary) = &predicate.expression else {
            continue;
        };
        if binary.operator != BinaryOperator::Equals {
            continue;
        }
        let pair = match (&binary.left, &binary.right) {
            (Expression::Property(p), Expression::Literal(lit))
            | (Expression::Literal(lit), Expression::Property(p)) => Some((p, lit)),
            _ => None,
        };
        if let Some((prop, literal)) = pair {
            if prop.variable == var {
                return Some((prop.property.clone(), literal.clone()));
            }
        }
    }
    None
}

fn split_conjuncts(expr: &Expression, out: &mut Vec<Predicate>) {
    if let Expression::Binary(binary) = expr {
        if binary.operator == BinaryOperator::And {
            split_conjuncts(&binary.left, out);
            split_conjuncts(&binary.right, out);
            return;
        }
    }
    let mut variables = Vec::new();
    collect_variables(expr, &mut variables);
    out.push(Predicate {
        expression: expr.clone(),
        variables,
    });
}

/// Outer variables an expression depends on. Pattern-existence tests only
/// anchor on their head variable; the rest of the pattern is local.
fn collect_variables(expr: &Expression, out: &mut Vec<String>) {
    match expr {
        Expression::Literal(_) => {}
        Expression::Variable(name) => push_unique(out, name),
        Expression::Property(access) => push_unique(out, &access.variable),
        Expression::Binary(binary) => {
            collect_variables(&binary.left, out);
            collect_variables(&binary.right, out);
        }
        Expression::Unary(unary) => collect_variables(&unary.operand, out),
        Expression::FunctionCall(call) => {
            for arg in &call.args {
                collect_variables(arg, out);
            }
        }
        Expression::PatternExists(pattern) => {
            if let Some(PathElement::Node(node)) = pattern.elements.first() {
                if let Some(var) = &node.variable {
                    push_unique(out, var);
                }
            }
        }
    }
}

fn push_unique(out: &mut Vec<String>, name: &str) {
    if !out.iter().any(|v| v == name) {
        out.push(name.to_string());
    }
}

fn aggregate_of(call: &FunctionCall) -> Result<Option<Aggregate>> {
    let arg = || -> Result<Expression> {
        call.args.first().cloned().ok_or_else(|| {
            Error::Runtime(format!("{} requires an argument", call.name))
        })
    };
    let aggregate = match call.name.to_uppercase().as_str() {
        "COUNT" => Aggregate::Count(call.args.first().cloned()),
        "SUM" => Aggregate::Sum(arg()?),
        "AVG" => Aggregate::Avg(arg()?),
        "MIN" => Aggregate::Min(arg()?),
        "MAX" => Aggregate::Max(arg()?),
        "DISTINCT" => Aggregate::Distinct(arg()?),
        _ => return Ok(None),
    };
    Ok(Some(aggregate))
}

fn contains_aggregate(expr: &Expression) -> bool {
    match expr {
        Expression::FunctionCall(call) => {
            matches!(
                call.name.to_uppercase().as_str(),
                "COUNT" | "SUM" | "AVG" | "MIN" | "MAX" | "DISTINCT"
            ) || call.args.iter().any(contains_aggregate)
        }
        Expression::Binary(binary) => {
            contains_aggregate(&binary.left) || contains_aggregate(&binary.right)
        }
        Expression::Unary(unary) => contains_aggregate(&unary.operand),
        _ => false,
    }
}

fn expr_alias(expr: &Expression) -> String {
    match expr {
        Expression::Variable(name) => name.clone(),
        Expression::Property(access) => format!("{}.{}", access.variable, access.property),
        Expression::FunctionCall(call) => {
            let inner = call
                .args
                .iter()
                .map(expr_alias)
                .collect::<Vec<_>>()
                .join(", ");
            if call.args.is_empty() && call.name.eq_ignore_ascii_case("count") {
                format!("{}(*)", call.name.to_lowercase())
            } else {
                format!("{}({inner})", call.name.to_lowercase())
            }
        }
        _ => "expr".to_string(),
    }
}

fn plan_projection(
    projection: &Projection,
    bound: &BTreeSet<String>,
    upstream: Option<&ProjectionPlan>,
) -> Result<ProjectionPlan> {
    let mut columns = Vec::new();
    let mut has_aggregates = false;

    // Aggregate columns produced by an upstream WITH; feeding them into
    // another aggregate is the nested form this engine rejects.
    let upstream_aggregates: BTreeSet<&str> = upstream
        .map(|plan| {
            plan.columns
                .iter()
                .filter(|c| matches!(c.kind, ColumnKind::Aggregate(_)))
                .map(|c| c.alias.as_str())
                .collect()
        })
        .unwrap_or_default();
    let scope: Option<BTreeSet<&str>> =
        upstream.map(|plan| plan.columns.iter().map(|c| c.alias.as_str()).collect());

    for item in &projection.items {
        let alias = item
            .alias
            .clone()
            .unwrap_or_else(|| expr_alias(&item.expression));

        let kind = match &item.expression {
            Expression::FunctionCall(call) => match aggregate_of(call)? {
                Some(aggregate) => {
                    for arg in &call.args {
                        if contains_aggregate(arg) {
                            return Err(syntax_nested_aggregate());
                        }
                        let mut vars = Vec::new();
                        collect_variables(arg, &mut vars);
                        if vars.iter().any(|v| upstream_aggregates.contains(v.as_str())) {
                            return Err(syntax_nested_aggregate());
                        }
                    }
                    has_aggregates = true;
                    ColumnKind::Aggregate(aggregate)
                }
                None => ColumnKind::Value(item.expression.clone()),
            },
            expr => {
                if contains_aggregate(expr) {
                    return Err(syntax_nested_aggregate());
                }
                ColumnKind::Value(expr.clone())
            }
        };

        // Every referenced variable must come from the pattern (or, after
        // WITH, from the projected columns).
        let mut vars = Vec::new();
        match &kind {
            ColumnKind::Value(expr) => collect_variables(expr, &mut vars),
            ColumnKind::Aggregate(aggregate) => {
                for expr in aggregate_args(aggregate) {
                    collect_variables(expr, &mut vars);
                }
            }
        }
        for var in vars {
            let known = match &scope {
                Some(names) => names.contains(var.as_str()),
                None => bound.contains(&var),
            };
            if !known {
                return Err(Error::Runtime(format!("unresolvable variable {var}")));
            }
        }

        columns.push(ColumnPlan { alias, kind });
    }

    Ok(ProjectionPlan {
        columns,
        has_aggregates,
    })
}

fn aggregate_args(aggregate: &Aggregate) -> Vec<&Expression> {
    match aggregate {
        Aggregate::Count(arg) => arg.iter().collect(),
        Aggregate::Sum(e)
        | Aggregate::Avg(e)
        | Aggregate::Min(e)
        | Aggregate::Max(e)
        | Aggregate::Distinct(e) => vec![e],
    }
}

fn syntax_nested_aggregate() -> Error {
    Error::Syntax {
        message: "nested aggregate".to_string(),
        token: String::new(),
        line: 0,
        column: 0,
    }
}
