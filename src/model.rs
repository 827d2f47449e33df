use crate::config::TrellisConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Char,
    Text,
    Integer,
    Float,
    Boolean,
    DateTime,
    Date,
    Time,
    Blob,
    Key,
    List,
}

/// Capability interface over field metadata. The planner and the
/// constraint engine depend only on this trait, never on a concrete
/// field representation.
pub trait FieldMeta: Send + Sync {
    fn column_name(&self) -> &str;
    fn is_primary_key(&self) -> bool;
    fn is_unique(&self) -> bool;
    fn internal_type(&self) -> FieldType;
}

/// Standard field implementation used by callers that describe their
/// schema directly rather than deriving it from an object mapper.
#[derive(Debug, Clone)]
pub struct Field {
    column: String,
    field_type: FieldType,
    primary_key: bool,
    unique: bool,
}

impl Field {
    pub fn new(column: &str, field_type: FieldType) -> Self {
        Self {
            column: column.to_string(),
            field_type,
            primary_key: false,
            unique: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

impl FieldMeta for Field {
    fn column_name(&self) -> &str {
        &self.column
    }

    fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    fn is_unique(&self) -> bool {
        self.unique
    }

    fn internal_type(&self) -> FieldType {
        self.field_type
    }
}

/// Table-level metadata handed in by the object-mapping layer.
pub struct Model {
    table: String,
    top_concrete_table: Option<String>,
    fields: Vec<Box<dyn FieldMeta>>,
    unique_together: Vec<Vec<String>>,
    enforce_constraints: Option<bool>,
}

impl Model {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            top_concrete_table: None,
            fields: Vec::new(),
            unique_together: Vec::new(),
            enforce_constraints: None,
        }
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(Box::new(field));
        self
    }

    pub fn dyn_field(mut self, field: Box<dyn FieldMeta>) -> Self {
        self.fields.push(field);
        self
    }

    pub fn unique_together(mut self, columns: &[&str]) -> Self {
        self.unique_together
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Polymodel subclasses store their rows in the hierarchy root's table.
    pub fn concrete_parent(mut self, table: &str) -> Self {
        self.top_concrete_table = Some(table.to_string());
        self
    }

    /// Per-model override of the global constraint enforcement flag.
    pub fn enforce_constraints(mut self, enabled: bool) -> Self {
        self.enforce_constraints = Some(enabled);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn top_concrete_table(&self) -> &str {
        self.top_concrete_table.as_deref().unwrap_or(&self.table)
    }

    pub fn fields(&self) -> impl Iterator<Item = &dyn FieldMeta> {
        self.fields.iter().map(|f| f.as_ref())
    }

    pub fn field_by_column(&self, column: &str) -> Option<&dyn FieldMeta> {
        self.fields
            .iter()
            .map(|f| f.as_ref())
            .find(|f| f.column_name() == column)
    }

    pub fn pk_column(&self) -> &str {
        self.fields
            .iter()
            .map(|f| f.as_ref())
            .find(|f| f.is_primary_key())
            .map(|f| f.column_name())
            .unwrap_or("id")
    }

    pub fn constraint_override(&self) -> Option<bool> {
        self.enforce_constraints
    }

    /// All unique constraint combinations declared on this model: one
    /// group per `unique_together` declaration and one singleton per
    /// unique field. Field names within a combination are sorted so the
    /// same logical constraint always produces the same combination
    /// regardless of declaration order.
    pub fn unique_combinations(&self, ignore_pk: bool) -> Vec<Vec<String>> {
        let mut combinations: Vec<Vec<String>> = self.unique_together.clone();
        for field in self.fields.iter().map(|f| f.as_ref()) {
            if field.is_primary_key() && ignore_pk {
                continue;
            }
            if field.is_unique() || field.is_primary_key() {
                combinations.push(vec![field.column_name().to_string()]);
            }
        }
        for combination in &mut combinations {
            combination.sort();
        }
        combinations
    }

    pub fn has_unique_constraints(&self) -> bool {
        !self.unique_combinations(true).is_empty()
    }
}

/// Whether unique constraints should be respected for this model, taking
/// the model-level opt-in and the global flag into account. A model-level
/// `true` wins over a disabled global flag.
pub fn has_active_unique_constraints(config: &TrellisConfig, model: &Model) -> bool {
    let enabled = match model.constraint_override() {
        Some(true) => true,
        _ => config.enforce_constraint_checks,
    };
    enabled && model.has_unique_constraints()
}
