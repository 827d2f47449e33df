use crate::Connection;
use crate::config::TrellisConfig;
use crate::constraints::identifiers::query_is_unique;
use crate::entity::{Entity, KEY_PROPERTY, Value};
use crate::error::TrellisError;
use crate::key::{Key, KeyId};
use crate::model::{FieldType, Model};
use crate::query::dnf::{Branch, normalize};
use crate::query::error::QueryError;
use crate::query::keyed::{KeyLookupQuery, UniqueLookup};
use crate::query::merge::MultiQuery;
use crate::query::utils::{compare_property_values, get_filter};
use crate::query::{FilterNode, FilterOp, NativeOp, OrderColumn, QuerySpec};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Execution strategy chosen for a select, in priority order: key-equality
/// lookups resolve by multi-get, a single branch matching a declared
/// unique constraint goes through the cache-assisted point lookup, a lone
/// branch runs as one native query, and anything else fans out through the
/// merge engine.
#[derive(Debug)]
pub enum ExecutionPlan {
    /// The filter tree normalized to zero branches; nothing can match.
    NoOp,
    Single(QuerySpec),
    Unique(UniqueLookup),
    Keys(KeyLookupQuery),
    Multi(MultiQuery),
}

impl ExecutionPlan {
    pub fn keys_only(&mut self) {
        match self {
            ExecutionPlan::NoOp => {}
            ExecutionPlan::Single(spec) => spec.keys_only = true,
            ExecutionPlan::Unique(lookup) => lookup.keys_only(),
            ExecutionPlan::Keys(lookup) => lookup.keys_only(),
            ExecutionPlan::Multi(multi) => multi.keys_only(),
        }
    }
}

/// Operators usable in a computed select expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Gt,
    Eq,
}

/// A computed column evaluated over each row after fetching: a binary
/// operator over column references and literals. Quoted literals are
/// sniffed for the common date formats.
#[derive(Debug, Clone)]
pub struct ExtraSelect {
    pub column: String,
    pub op: ExtraOp,
    pub left: String,
    pub right: String,
}

impl ExtraSelect {
    pub fn new(column: &str, op: ExtraOp, left: &str, right: &str) -> Self {
        Self {
            column: column.to_string(),
            op,
            left: left.to_string(),
            right: right.to_string(),
        }
    }

    fn evaluate(&self, entity: &Entity, model: &Model) -> Value {
        let lhs = resolve_extra_arg(&self.left, entity, model);
        let rhs = resolve_extra_arg(&self.right, entity, model);
        match self.op {
            ExtraOp::Add | ExtraOp::Sub | ExtraOp::Mul | ExtraOp::Div => {
                numeric_extra(self.op, &lhs, &rhs)
            }
            ExtraOp::Lt => boolean_extra(&lhs, &rhs, Ordering::is_lt),
            ExtraOp::Gt => boolean_extra(&lhs, &rhs, Ordering::is_gt),
            ExtraOp::Eq => boolean_extra(&lhs, &rhs, Ordering::is_eq),
        }
    }
}

fn resolve_extra_arg(arg: &str, entity: &Entity, model: &Model) -> Value {
    if arg.len() >= 2 && arg.starts_with('\'') && arg.ends_with('\'') {
        let literal = &arg[1..arg.len() - 1];
        if let Ok(stamp) = NaiveDateTime::parse_from_str(literal, "%Y-%m-%d %H:%M:%S") {
            return Value::Timestamp(stamp.and_utc());
        }
        if let Ok(date) = NaiveDate::parse_from_str(literal, "%Y-%m-%d")
            && let Some(stamp) = date.and_hms_opt(0, 0, 0)
        {
            return Value::Timestamp(stamp.and_utc());
        }
        return Value::Text(literal.into());
    }
    if model.field_by_column(arg).is_some() {
        return entity.get(arg).cloned().unwrap_or(Value::Null);
    }
    match arg.to_ascii_lowercase().as_str() {
        "null" => return Value::Null,
        "true" => return Value::Boolean(true),
        "false" => return Value::Boolean(false),
        _ => {}
    }
    if let Ok(integer) = arg.parse::<i64>() {
        return Value::Integer(integer);
    }
    Value::Text(arg.into())
}

fn numeric_extra(op: ExtraOp, lhs: &Value, rhs: &Value) -> Value {
    match (lhs, rhs) {
        (Value::Integer(a), Value::Integer(b)) => match op {
            ExtraOp::Add => Value::Integer(a.saturating_add(*b)),
            ExtraOp::Sub => Value::Integer(a.saturating_sub(*b)),
            ExtraOp::Mul => Value::Integer(a.saturating_mul(*b)),
            ExtraOp::Div if *b != 0 => Value::Integer(a / b),
            _ => Value::Null,
        },
        (Value::Integer(_), Value::Float(_))
        | (Value::Float(_), Value::Integer(_))
        | (Value::Float(_), Value::Float(_)) => {
            let a = float_of(lhs);
            let b = float_of(rhs);
            match op {
                ExtraOp::Add => Value::Float(a + b),
                ExtraOp::Sub => Value::Float(a - b),
                ExtraOp::Mul => Value::Float(a * b),
                ExtraOp::Div if b != 0.0 => Value::Float(a / b),
                _ => Value::Null,
            }
        }
        _ => Value::Null,
    }
}

fn float_of(value: &Value) -> f64 {
    match value {
        Value::Integer(i) => *i as f64,
        Value::Float(f) => *f,
        _ => 0.0,
    }
}

fn boolean_extra(lhs: &Value, rhs: &Value, predicate: impl Fn(Ordering) -> bool) -> Value {
    match compare_property_values(lhs, rhs) {
        Some(ordering) => Value::Boolean(predicate(ordering)),
        None => Value::Null,
    }
}

/// A prepared select over one model: filter tree, projection, ordering,
/// window and post-processing directives. Planning normalizes the filter
/// and picks the execution strategy; fetching runs it and applies the
/// result transform pipeline.
pub struct SelectQuery<'a> {
    model: &'a Model,
    namespace: String,
    filter: Option<FilterNode>,
    columns: Vec<String>,
    distinct: bool,
    ordering: Vec<OrderColumn>,
    offset: usize,
    limit: Option<usize>,
    excluded_keys: Vec<Key>,
    extra_selects: Vec<ExtraSelect>,
    keys_only: bool,
}

impl<'a> SelectQuery<'a> {
    pub fn new(model: &'a Model, namespace: &str) -> Self {
        Self {
            model,
            namespace: namespace.to_string(),
            filter: None,
            columns: Vec::new(),
            distinct: false,
            ordering: Vec::new(),
            offset: 0,
            limit: None,
            excluded_keys: Vec::new(),
            extra_selects: Vec::new(),
            keys_only: false,
        }
    }

    pub fn filter(mut self, tree: FilterNode) -> Self {
        self.filter = Some(tree);
        self
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Ordering specs; a leading `-` marks a descending column.
    pub fn order_by(mut self, columns: &[&str]) -> Self {
        self.ordering = columns.iter().map(|c| OrderColumn::parse(c)).collect();
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn exclude_keys(mut self, keys: Vec<Key>) -> Self {
        self.excluded_keys = keys;
        self
    }

    pub fn extra_select(mut self, extra: ExtraSelect) -> Self {
        self.extra_selects.push(extra);
        self
    }

    pub fn keys_only(mut self) -> Self {
        self.keys_only = true;
        self
    }

    fn projection(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.as_str() != self.model.pk_column())
            .cloned()
            .collect()
    }

    fn effective_ordering(&self) -> Vec<OrderColumn> {
        if self.distinct && self.ordering.is_empty() {
            // The backing engine refuses a distinct scan without an
            // ordering over the distinct columns; default to them. Column
            // order is unspecified here and any order satisfies the scan.
            return self.columns.iter().map(|c| OrderColumn::asc(c)).collect();
        }
        self.ordering.clone()
    }

    fn requested_keys_only(&self) -> bool {
        self.keys_only
            || (self.columns.len() == 1 && self.columns[0] == self.model.pk_column())
    }

    fn key_filter_value(&self, value: &Value) -> Result<Value, TrellisError> {
        let key = match value {
            Value::Key(key) => key.in_namespace(&self.namespace),
            Value::Integer(id) => {
                Key::with_id(self.model.top_concrete_table(), *id, &self.namespace)
            }
            Value::Text(name) => {
                Key::with_name(self.model.top_concrete_table(), name, &self.namespace)
            }
            other => {
                return Err(QueryError::MalformedFilter {
                    reason: format!("cannot filter the identity column with {other:?}"),
                }
                .into());
            }
        };
        Ok(Value::Key(key))
    }

    fn build_branch_query(
        &self,
        branch: &Branch,
        keys_only: bool,
        ordering: &[OrderColumn],
        projection: &[String],
    ) -> Result<QuerySpec, TrellisError> {
        let mut spec = QuerySpec::new(self.model.top_concrete_table(), &self.namespace);
        spec.keys_only = keys_only;
        spec.ordering = ordering.to_vec();
        spec.projection = projection.to_vec();
        if self.distinct {
            spec.distinct_on = projection.to_vec();
        }

        for leaf in &branch.filters {
            let (op, mut value) = match leaf.op {
                FilterOp::Eq => (NativeOp::Eq, leaf.value.clone()),
                FilterOp::Gt => (NativeOp::Gt, leaf.value.clone()),
                FilterOp::Gte => (NativeOp::Gte, leaf.value.clone()),
                FilterOp::Lt => (NativeOp::Lt, leaf.value.clone()),
                FilterOp::Lte => (NativeOp::Lte, leaf.value.clone()),
                FilterOp::IsNull => {
                    let Value::Boolean(null) = leaf.value else {
                        return Err(QueryError::MalformedFilter {
                            reason: format!("isnull on '{}' requires a boolean", leaf.column),
                        }
                        .into());
                    };
                    // NULL ranks below every value, so "is not null" is a
                    // native range filter above it.
                    if null {
                        (NativeOp::Eq, Value::Null)
                    } else {
                        (NativeOp::Gt, Value::Null)
                    }
                }
                FilterOp::In | FilterOp::Range => {
                    return Err(QueryError::MalformedFilter {
                        reason: "unnormalized filter reached the planner".into(),
                    }
                    .into());
                }
            };

            let column = if leaf.column == self.model.pk_column() || leaf.column == KEY_PROPERTY {
                value = self.key_filter_value(&value)?;
                KEY_PROPERTY.to_string()
            } else {
                leaf.column.clone()
            };
            add_branch_filter(&mut spec, &column, op, value);
        }
        Ok(spec)
    }

    /// Normalizes the filter and selects the execution strategy.
    pub fn plan(&self, config: &TrellisConfig) -> Result<ExecutionPlan, TrellisError> {
        if self.distinct && self.columns.is_empty() {
            return Err(TrellisError::NotSupported(
                "distinct requires projected columns".into(),
            ));
        }
        let projection = self.projection();
        let ordering = self.effective_ordering();

        let Some(tree) = &self.filter else {
            let spec = self.build_branch_query(
                &Branch::default(),
                self.requested_keys_only(),
                &ordering,
                &projection,
            )?;
            return Ok(ExecutionPlan::Single(spec));
        };

        let normalized = normalize(tree, config.max_query_branches)?;
        if normalized.branches.is_empty() {
            return Ok(ExecutionPlan::NoOp);
        }

        // A keys-only fan-out cannot be merged the way a valued one is,
        // and the full rows are cheaper to fetch than to reconcile.
        let mut keys_only = self.requested_keys_only();
        if keys_only && normalized.branches.len() > 1 {
            tracing::debug!(
                branches = normalized.branches.len(),
                "downgrading keys-only select for multi-branch execution"
            );
            keys_only = false;
        }

        let mut specs = normalized
            .branches
            .iter()
            .map(|branch| self.build_branch_query(branch, keys_only, &ordering, &projection))
            .collect::<Result<Vec<_>, _>>()?;

        if specs.iter().all(is_key_equality_query) {
            return Ok(ExecutionPlan::Keys(KeyLookupQuery::new(
                specs,
                ordering,
                config.max_query_branches,
            )?));
        }
        if specs.len() == 1 {
            let Some(spec) = specs.pop() else {
                return Ok(ExecutionPlan::NoOp);
            };
            if let Some(identifier) = query_is_unique(self.model, &spec) {
                return Ok(ExecutionPlan::Unique(UniqueLookup::new(identifier, spec)));
            }
            return Ok(ExecutionPlan::Single(spec));
        }
        Ok(ExecutionPlan::Multi(MultiQuery::new(specs, ordering)))
    }

    fn run_plan(
        &self,
        conn: &Connection,
        plan: &ExecutionPlan,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Entity>, TrellisError> {
        match plan {
            ExecutionPlan::NoOp => Ok(Vec::new()),
            ExecutionPlan::Single(spec) => conn.store().run_query(spec, limit, offset),
            ExecutionPlan::Unique(lookup) => {
                lookup.fetch(conn.store(), conn.cache(), self.model, offset, limit)
            }
            ExecutionPlan::Keys(lookup) => lookup.fetch(
                conn.store(),
                conn.config.merge_worker_threads,
                offset,
                limit,
            ),
            ExecutionPlan::Multi(multi) => Ok(multi
                .fetch(
                    conn.store(),
                    conn.config.merge_worker_threads,
                    offset,
                    limit,
                )?
                .collect()),
        }
    }

    fn namespaced_excluded_keys(&self) -> Vec<Key> {
        self.excluded_keys
            .iter()
            .map(|k| k.in_namespace(&self.namespace))
            .collect()
    }

    /// Plans, executes and post-processes the select.
    pub fn fetch(&self, conn: &Connection) -> Result<Vec<Entity>, TrellisError> {
        let plan = self.plan(&conn.config)?;
        let excluded = self.namespaced_excluded_keys();
        // Rows dropped by the exclusion set must not eat into the window;
        // over-fetch and trim back afterwards.
        let mut limit = self.limit;
        if !excluded.is_empty()
            && let Some(requested) = limit
        {
            limit = Some(requested + excluded.len());
        }
        let raw = self.run_plan(conn, &plan, self.offset, limit)?;

        let mut seen_tuples: BTreeSet<Vec<Value>> = BTreeSet::new();
        let mut results = Vec::new();
        for entity in raw {
            let Some(entity) = self.transform(entity, &excluded, &mut seen_tuples) else {
                continue;
            };
            results.push(entity);
            if let Some(requested) = self.limit
                && results.len() >= requested
            {
                break;
            }
        }
        Ok(results)
    }

    /// COUNT pseudo-aggregate. Without exclusions this is a keys-only
    /// fetch; with exclusions the key set is fetched in full and the
    /// exclusion membership subtracted in memory, since the store has no
    /// atomic "count minus exclusions" primitive.
    pub fn count(&self, conn: &Connection) -> Result<usize, TrellisError> {
        let mut plan = self.plan(&conn.config)?;
        plan.keys_only();
        let excluded = self.namespaced_excluded_keys();
        if excluded.is_empty() {
            let raw = self.run_plan(conn, &plan, self.offset, self.limit)?;
            return Ok(raw.len());
        }
        conn.reporter().warn_once(
            "count-with-exclusions fetches the full key set and subtracts membership in memory",
        );
        let limit = self.limit.map(|l| l + excluded.len());
        let raw = self.run_plan(conn, &plan, self.offset, limit)?;
        let counted = raw.iter().filter(|e| !excluded.contains(&e.key)).count();
        Ok(counted.min(self.limit.unwrap_or(usize::MAX)))
    }

    /// AVERAGE is not expressible against the backing store.
    pub fn average(&self, _conn: &Connection) -> Result<f64, TrellisError> {
        Err(TrellisError::NotSupported("AVERAGE is not supported".into()))
    }

    /// Result transform pipeline, applied per raw row in order: exclusion
    /// drop, temporal coercion, projected-string normalization, identity
    /// remapping onto the declared pk column, computed selects, and the
    /// distinct/computed-select de-duplication.
    fn transform(
        &self,
        mut entity: Entity,
        excluded: &[Key],
        seen_tuples: &mut BTreeSet<Vec<Value>>,
    ) -> Option<Entity> {
        if excluded.contains(&entity.key) {
            return None;
        }

        for field in self.model.fields() {
            match field.internal_type() {
                FieldType::DateTime | FieldType::Date | FieldType::Time => {
                    if let Some(Value::Integer(micros)) = entity.get(field.column_name()).cloned()
                        && let Some(stamp) = DateTime::from_timestamp_micros(micros)
                    {
                        entity.set(field.column_name(), Value::Timestamp(stamp));
                    }
                }
                FieldType::Char => {
                    if let Some(Value::Blob(bytes)) = entity.get(field.column_name()).cloned() {
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        entity.set(field.column_name(), Value::Text(text.into()));
                    }
                }
                _ => {}
            }
        }

        if let Some(id) = entity.key.id_or_name() {
            let value = match id {
                KeyId::Id(id) => Value::Integer(*id),
                KeyId::Name(name) => Value::Text(name.clone()),
            };
            entity.set(self.model.pk_column(), value);
        }

        for extra in &self.extra_selects {
            let value = extra.evaluate(&entity, self.model);
            entity.set(extra.column.clone(), value);
        }

        if self.distinct && !self.extra_selects.is_empty() {
            let columns = self.projection();
            if !columns.is_empty() {
                let tuple: Vec<Value> = columns
                    .iter()
                    .filter_map(|c| entity.get(c).cloned())
                    .collect();
                if !seen_tuples.insert(tuple) {
                    return None;
                }
            }
        }

        Some(entity)
    }
}

fn is_key_equality_query(spec: &QuerySpec) -> bool {
    get_filter(spec, KEY_PROPERTY, NativeOp::Eq).is_some_and(|v| v.as_key().is_some())
}

/// Duplicate `(column, operator)` pairs coalesce into one IN-style
/// multi-value filter instead of overwriting each other. A genuinely
/// list-typed value is nested one level deeper before submission; the
/// backing engine does not accept raw multi-valued arguments for non-IN
/// operators.
fn add_branch_filter(spec: &mut QuerySpec, column: &str, op: NativeOp, value: Value) {
    if let Some(existing) = get_filter(spec, column, op).cloned() {
        match existing {
            Value::List(mut values) => {
                if !values.contains(&value) {
                    values.push(value);
                }
                spec.replace_filter(column, op, Value::List(values));
            }
            scalar if scalar == value => {}
            scalar => {
                spec.replace_filter(column, op, Value::List(vec![scalar, value]));
            }
        }
        return;
    }
    let value = match value {
        Value::List(inner) => Value::List(vec![Value::List(inner)]),
        other => other,
    };
    spec.add_filter(column, op, value);
}

#[cfg(test)]
mod tests {
    use super::{ExecutionPlan, ExtraOp, ExtraSelect, SelectQuery};
    use crate::config::TrellisConfig;
    use crate::entity::{KEY_PROPERTY, Value};
    use crate::error::TrellisError;
    use crate::model::{Field, FieldType, Model};
    use crate::query::utils::get_filter;
    use crate::query::{FilterNode, NativeOp};

    fn model() -> Model {
        Model::new("multi_query_model")
            .field(Field::new("id", FieldType::Integer).primary_key())
            .field(Field::new("field1", FieldType::Integer))
            .field(Field::new("field2", FieldType::Char).unique())
    }

    fn config() -> TrellisConfig {
        TrellisConfig::default()
    }

    #[test]
    fn distinct_without_projection_is_rejected() {
        let model = model();
        let query = SelectQuery::new(&model, "").distinct();
        let err = query.plan(&config()).expect_err("must fail");
        assert!(matches!(err, TrellisError::NotSupported(_)));
    }

    #[test]
    fn distinct_defaults_ordering_to_the_projected_columns() {
        let model = model();
        let query = SelectQuery::new(&model, "")
            .columns(&["field1"])
            .distinct();
        let plan = query.plan(&config()).expect("plan");
        let ExecutionPlan::Single(spec) = plan else {
            panic!("expected a single native query");
        };
        assert_eq!(spec.ordering.len(), 1);
        assert_eq!(spec.ordering[0].column, "field1");
        assert_eq!(spec.distinct_on, vec!["field1".to_string()]);
    }

    #[test]
    fn pk_only_projection_enables_keys_only() {
        let model = model();
        let query = SelectQuery::new(&model, "")
            .columns(&["id"])
            .filter(FilterNode::gt("field1", 0i64));
        let plan = query.plan(&config()).expect("plan");
        let ExecutionPlan::Single(spec) = plan else {
            panic!("expected a single native query");
        };
        assert!(spec.keys_only);
    }

    #[test]
    fn keys_only_is_downgraded_for_multi_branch_plans() {
        let model = model();
        let query = SelectQuery::new(&model, "")
            .keys_only()
            .filter(FilterNode::in_list(
                "field1",
                vec![Value::Integer(1), Value::Integer(2)],
            ));
        let plan = query.plan(&config()).expect("plan");
        let ExecutionPlan::Multi(multi) = plan else {
            panic!("expected a multi-query plan");
        };
        assert_eq!(multi.query_count(), 2);
    }

    #[test]
    fn pk_filters_become_key_lookups() {
        let model = model();
        let query = SelectQuery::new(&model, "ns").filter(FilterNode::in_list(
            "id",
            vec![Value::Integer(1), Value::Integer(2)],
        ));
        let plan = query.plan(&config()).expect("plan");
        assert!(matches!(plan, ExecutionPlan::Keys(_)));
    }

    #[test]
    fn unique_equality_plans_a_point_lookup() {
        let model = model();
        let query = SelectQuery::new(&model, "").filter(FilterNode::eq("field2", "ashton"));
        let plan = query.plan(&config()).expect("plan");
        let ExecutionPlan::Unique(lookup) = plan else {
            panic!("expected a unique point lookup");
        };
        assert!(lookup.identifier().starts_with("multi_query_model|field2:"));
    }

    #[test]
    fn duplicate_lookups_coalesce_into_multi_value_filters() {
        let model = model();
        let query = SelectQuery::new(&model, "").filter(FilterNode::and(vec![
            FilterNode::eq("field1", 1i64),
            FilterNode::eq("field1", 2i64),
        ]));
        let plan = query.plan(&config()).expect("plan");
        let ExecutionPlan::Single(spec) = plan else {
            panic!("expected a single native query");
        };
        assert_eq!(spec.filters.len(), 1);
        assert_eq!(
            get_filter(&spec, "field1", NativeOp::Eq),
            Some(&Value::List(vec![Value::Integer(1), Value::Integer(2)]))
        );
    }

    #[test]
    fn list_values_are_nested_one_level_deeper() {
        let model = model();
        let inner = vec![Value::Integer(1), Value::Integer(2)];
        let query = SelectQuery::new(&model, "")
            .filter(FilterNode::eq("field1", Value::List(inner.clone())));
        let plan = query.plan(&config()).expect("plan");
        let ExecutionPlan::Single(spec) = plan else {
            panic!("expected a single native query");
        };
        assert_eq!(
            get_filter(&spec, "field1", NativeOp::Eq),
            Some(&Value::List(vec![Value::List(inner)]))
        );
    }

    #[test]
    fn isnull_translates_to_null_range_filters() {
        let model = model();
        let query = SelectQuery::new(&model, "").filter(FilterNode::and(vec![
            FilterNode::isnull("field1", true),
            FilterNode::isnull("field2", false),
        ]));
        let plan = query.plan(&config()).expect("plan");
        let ExecutionPlan::Single(spec) = plan else {
            panic!("expected a single native query");
        };
        assert_eq!(get_filter(&spec, "field1", NativeOp::Eq), Some(&Value::Null));
        assert_eq!(get_filter(&spec, "field2", NativeOp::Gt), Some(&Value::Null));
    }

    #[test]
    fn pk_filter_values_become_namespaced_keys() {
        let model = model();
        // Even with extra predicates in the branch, a pk equality routes
        // to the key-lookup fast path; the extra filters re-validate the
        // fetched rows.
        let query = SelectQuery::new(&model, "ns").filter(FilterNode::and(vec![
            FilterNode::eq("id", 7i64),
            FilterNode::gt("field1", 0i64),
        ]));
        assert!(matches!(
            query.plan(&config()).expect("plan"),
            ExecutionPlan::Keys(_)
        ));

        // A scalar pk value in a non-fast-path branch is coerced into a
        // key literal carrying the connection namespace.
        let spec = query
            .build_branch_query(
                &crate::query::dnf::Branch {
                    filters: vec![crate::query::dnf::BranchFilter {
                        column: "id".into(),
                        op: crate::query::FilterOp::Eq,
                        value: Value::Integer(7),
                    }],
                },
                false,
                &[],
                &[],
            )
            .expect("branch");
        let value = get_filter(&spec, KEY_PROPERTY, NativeOp::Eq).expect("key filter");
        let key = value.as_key().expect("key literal");
        assert_eq!(key.namespace, "ns");
        assert_eq!(key.kind, "multi_query_model");
    }

    #[test]
    fn extra_select_evaluates_literals_and_columns() {
        let model = model();
        let extra = ExtraSelect::new("total", ExtraOp::Add, "field1", "10");
        let mut entity = crate::entity::Entity::new(crate::key::Key::with_id("t", 1, ""));
        entity.set("field1", 5i64);
        assert_eq!(extra.evaluate(&entity, &model), Value::Integer(15));

        let flag = ExtraSelect::new("flag", ExtraOp::Gt, "field1", "3");
        assert_eq!(flag.evaluate(&entity, &model), Value::Boolean(true));
    }
}
