//! Capability table served for `CommandGetSqlInfo`.
//!
//! The table has two columns: `info_name: uint32` and `value`, a dense union
//! with six children in a fixed order:
//!
//! | type id | child                     | arrow type                     |
//! |---------|---------------------------|--------------------------------|
//! | 0       | `string_value`            | utf8                           |
//! | 1       | `bool_value`              | bool                           |
//! | 2       | `bigint_value`            | int64                          |
//! | 3       | `int32_bitmask`           | int32                          |
//! | 4       | `string_list`             | list<utf8>                     |
//! | 5       | `int32_to_int32_list_map` | map<int32, list<int32>>        |
//!
//! Each row occupies exactly one slot in exactly one child. The offsets
//! buffer maps the logical row to that slot.

use arrow_array::builder::{
    ArrayBuilder, BooleanBuilder, Int32Builder, Int64Builder, ListBuilder, MapBuilder,
    StringBuilder, UInt32Builder,
};
use arrow_array::cast::AsArray;
use arrow_array::types::{Int32Type, Int64Type};
use arrow_array::{Array, ArrayRef, RecordBatch, UnionArray};
use arrow_schema::{ArrowError, DataType, Field, Fields, Schema, SchemaRef, UnionFields, UnionMode};
use std::sync::Arc;

/// Arrow major version reported to clients; the workspace pins arrow to this major.
pub const ARROW_VERSION: &str = "56";

/// Default server name reported in the capability table.
pub const DEFAULT_SERVER_NAME: &str = "duckflight";

// Flight SQL `SqlInfo` ids.
pub const SERVER_NAME: u32 = 0;
pub const SERVER_VERSION: u32 = 1;
pub const SERVER_ARROW_VERSION: u32 = 2;
pub const SERVER_READ_ONLY: u32 = 3;
pub const SERVER_TRANSACTION: u32 = 8;
pub const DDL_CATALOG: u32 = 500;
pub const DDL_SCHEMA: u32 = 501;
pub const DDL_TABLE: u32 = 502;
pub const IDENTIFIER_CASE: u32 = 503;
pub const IDENTIFIER_QUOTE_CHAR: u32 = 504;
pub const QUOTED_IDENTIFIER_CASE: u32 = 505;
pub const ALL_TABLES_ARE_SELECTABLE: u32 = 506;
pub const NULL_ORDERING: u32 = 507;
pub const KEYWORDS: u32 = 508;
pub const NUMERIC_FUNCTIONS: u32 = 509;
pub const STRING_FUNCTIONS: u32 = 510;
pub const SUPPORTS_CONVERT: u32 = 517;

const CASE_INSENSITIVE: i64 = 1;
const NULLS_SORTED_AT_START: i64 = 2;
const TRANSACTION_NONE: i32 = 0;
const CONVERT_BIGINT: i32 = 0;
const CONVERT_INTEGER: i32 = 7;

const SQL_KEYWORDS: &[&str] = &[
    "ABORT", "ACTION", "ADD", "AFTER", "ALL", "ALTER", "ANALYZE", "AND", "AS", "ASC", "ATTACH",
    "BEFORE", "BEGIN", "BETWEEN", "BY", "CASCADE", "CASE", "CAST", "CHECK", "COLLATE", "COLUMN",
    "COMMIT", "CONFLICT", "CONSTRAINT", "CREATE", "CROSS", "CURRENT", "CURRENT_DATE",
    "CURRENT_TIME", "CURRENT_TIMESTAMP", "DATABASE", "DEFAULT", "DELETE", "DESC", "DETACH",
    "DISTINCT", "DO", "DROP", "ELSE", "END", "ESCAPE", "EXCEPT", "EXCLUDE", "EXISTS", "EXPLAIN",
    "FILTER", "FIRST", "FOLLOWING", "FOR", "FOREIGN", "FROM", "FULL", "GENERATED", "GLOB",
    "GROUP", "GROUPS", "HAVING", "IF", "IGNORE", "IN", "INDEX", "INNER", "INSERT", "INSTEAD",
    "INTERSECT", "INTO", "IS", "ISNULL", "JOIN", "KEY", "LAST", "LEFT", "LIKE", "LIMIT", "MATCH",
    "MATERIALIZED", "NATURAL", "NO", "NOT", "NOTHING", "NOTNULL", "NULL", "NULLS", "OF",
    "OFFSET", "ON", "OR", "ORDER", "OTHERS", "OUTER", "OVER", "PARTITION", "PRAGMA",
    "PRECEDING", "PRIMARY", "QUALIFY", "RANGE", "RECURSIVE", "REFERENCES", "REGEXP", "RENAME",
    "REPLACE", "RESTRICT", "RETURNING", "RIGHT", "ROLLBACK", "ROW", "ROWS", "SAVEPOINT",
    "SELECT", "SET", "TABLE", "TEMP", "TEMPORARY", "THEN", "TIES", "TO", "TRANSACTION",
    "TRIGGER", "UNBOUNDED", "UNION", "UNIQUE", "UPDATE", "USING", "VACUUM", "VALUES", "VIEW",
    "VIRTUAL", "WHEN", "WHERE", "WINDOW", "WITH", "WITHOUT",
];

const NUMERIC_FUNCTION_NAMES: &[&str] = &[
    "ACOS", "ACOSH", "ASIN", "ASINH", "ATAN", "ATAN2", "ATANH", "CEIL", "CEILING", "COS", "COSH",
    "DEGREES", "EXP", "FLOOR", "LN", "LOG", "LOG10", "LOG2", "MOD", "PI", "POW", "POWER",
    "RADIANS", "SIN", "SINH", "SQRT", "TAN", "TANH", "TRUNC",
];

const STRING_FUNCTION_NAMES: &[&str] = &[
    "SUBSTR", "TRIM", "LTRIM", "RTRIM", "LENGTH", "REPLACE", "UPPER", "LOWER", "INSTR",
];

/// Discriminator of a [`TaggedValue`]; the numeric value is the union type id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum ValueKind {
    String = 0,
    Bool = 1,
    BigInt = 2,
    Int32Bitmask = 3,
    StringList = 4,
    Int32ToInt32ListMap = 5,
}

impl ValueKind {
    pub const ALL: [ValueKind; 6] = [
        ValueKind::String,
        ValueKind::Bool,
        ValueKind::BigInt,
        ValueKind::Int32Bitmask,
        ValueKind::StringList,
        ValueKind::Int32ToInt32ListMap,
    ];

    pub fn type_id(self) -> i8 {
        self as i8
    }

    pub fn from_type_id(type_id: i8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.type_id() == type_id)
    }
}

/// A capability value. Map entries keep their insertion order.
#[derive(Debug, Clone, PartialEq)]
pub enum TaggedValue {
    String(String),
    Bool(bool),
    BigInt(i64),
    Int32Bitmask(i32),
    StringList(Vec<String>),
    Int32ToInt32ListMap(Vec<(i32, Vec<i32>)>),
}

impl TaggedValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            TaggedValue::String(_) => ValueKind::String,
            TaggedValue::Bool(_) => ValueKind::Bool,
            TaggedValue::BigInt(_) => ValueKind::BigInt,
            TaggedValue::Int32Bitmask(_) => ValueKind::Int32Bitmask,
            TaggedValue::StringList(_) => ValueKind::StringList,
            TaggedValue::Int32ToInt32ListMap(_) => ValueKind::Int32ToInt32ListMap,
        }
    }

    /// Read the value stored for logical row `row` of a capability union.
    pub fn from_union(array: &UnionArray, row: usize) -> Result<Self, ArrowError> {
        if row >= array.len() {
            return Err(ArrowError::InvalidArgumentError(format!(
                "row {row} out of bounds for union of length {}",
                array.len()
            )));
        }
        let type_id = array.type_id(row);
        let kind = ValueKind::from_type_id(type_id).ok_or_else(|| {
            ArrowError::InvalidArgumentError(format!("unknown union type id {type_id}"))
        })?;
        let child = array.child(type_id);
        let slot = array.value_offset(row);

        let value = match kind {
            ValueKind::String => TaggedValue::String(
                child
                    .as_string_opt::<i32>()
                    .ok_or_else(|| child_type_error(kind, child))?
                    .value(slot)
                    .to_string(),
            ),
            ValueKind::Bool => TaggedValue::Bool(
                child
                    .as_boolean_opt()
                    .ok_or_else(|| child_type_error(kind, child))?
                    .value(slot),
            ),
            ValueKind::BigInt => TaggedValue::BigInt(
                child
                    .as_primitive_opt::<Int64Type>()
                    .ok_or_else(|| child_type_error(kind, child))?
                    .value(slot),
            ),
            ValueKind::Int32Bitmask => TaggedValue::Int32Bitmask(
                child
                    .as_primitive_opt::<Int32Type>()
                    .ok_or_else(|| child_type_error(kind, child))?
                    .value(slot),
            ),
            ValueKind::StringList => {
                let list = child
                    .as_list_opt::<i32>()
                    .ok_or_else(|| child_type_error(kind, child))?;
                let items = list.value(slot);
                let strings = items
                    .as_string_opt::<i32>()
                    .ok_or_else(|| child_type_error(kind, &items))?;
                TaggedValue::StringList(
                    (0..strings.len()).map(|i| strings.value(i).to_string()).collect(),
                )
            }
            ValueKind::Int32ToInt32ListMap => {
                let map = child.as_map_opt().ok_or_else(|| child_type_error(kind, child))?;
                let entries = map.value(slot);
                let keys = entries
                    .column(0)
                    .as_primitive_opt::<Int32Type>()
                    .ok_or_else(|| child_type_error(kind, entries.column(0)))?;
                let lists = entries
                    .column(1)
                    .as_list_opt::<i32>()
                    .ok_or_else(|| child_type_error(kind, entries.column(1)))?;
                let mut pairs = Vec::with_capacity(entries.len());
                for i in 0..entries.len() {
                    let items = lists.value(i);
                    let ints = items
                        .as_primitive_opt::<Int32Type>()
                        .ok_or_else(|| child_type_error(kind, &items))?;
                    pairs.push((keys.value(i), ints.values().to_vec()));
                }
                TaggedValue::Int32ToInt32ListMap(pairs)
            }
        };
        Ok(value)
    }
}

fn child_type_error(kind: ValueKind, child: &ArrayRef) -> ArrowError {
    ArrowError::InvalidArgumentError(format!(
        "union child for {kind:?} has unexpected type {}",
        child.data_type()
    ))
}

/// One row of the capability table.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityEntry {
    pub id: u32,
    pub value: TaggedValue,
}

impl CapabilityEntry {
    pub fn new(id: u32, value: TaggedValue) -> Self {
        Self { id, value }
    }
}

/// Process-level facts that feed the capability table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub name: String,
    pub version: String,
    pub read_only: bool,
}

impl ServerIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>, read_only: bool) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            read_only,
        }
    }
}

fn string_list_type() -> DataType {
    DataType::List(Arc::new(Field::new_list_field(DataType::Utf8, true)))
}

fn int32_list_type() -> DataType {
    DataType::List(Arc::new(Field::new_list_field(DataType::Int32, true)))
}

// Must agree with what `MapBuilder` produces with default field names.
fn int32_to_int32_list_map_type() -> DataType {
    let entries = Fields::from(vec![
        Field::new("keys", DataType::Int32, false),
        Field::new("values", int32_list_type(), true),
    ]);
    DataType::Map(
        Arc::new(Field::new("entries", DataType::Struct(entries), false)),
        false,
    )
}

/// Union fields of the `value` column, indexed by [`ValueKind`].
pub fn value_union_fields() -> UnionFields {
    UnionFields::new(
        ValueKind::ALL.map(ValueKind::type_id),
        vec![
            Field::new("string_value", DataType::Utf8, false),
            Field::new("bool_value", DataType::Boolean, false),
            Field::new("bigint_value", DataType::Int64, false),
            Field::new("int32_bitmask", DataType::Int32, false),
            Field::new("string_list", string_list_type(), false),
            Field::new("int32_to_int32_list_map", int32_to_int32_list_map_type(), false),
        ],
    )
}

/// Schema of the capability table.
pub fn sql_info_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("info_name", DataType::UInt32, false),
        Field::new(
            "value",
            DataType::Union(value_union_fields(), UnionMode::Dense),
            false,
        ),
    ]))
}

/// Dense union encoder for capability values.
///
/// `append` writes the type id and offset, and pushes the value into the
/// active child only. Inactive children are never padded.
pub struct SqlInfoUnionBuilder {
    type_ids: Vec<i8>,
    offsets: Vec<i32>,
    strings: StringBuilder,
    bools: BooleanBuilder,
    bigints: Int64Builder,
    bitmasks: Int32Builder,
    string_lists: ListBuilder<StringBuilder>,
    int32_maps: MapBuilder<Int32Builder, ListBuilder<Int32Builder>>,
}

impl Default for SqlInfoUnionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlInfoUnionBuilder {
    pub fn new() -> Self {
        Self {
            type_ids: Vec::new(),
            offsets: Vec::new(),
            strings: StringBuilder::new(),
            bools: BooleanBuilder::new(),
            bigints: Int64Builder::new(),
            bitmasks: Int32Builder::new(),
            string_lists: ListBuilder::new(StringBuilder::new()),
            int32_maps: MapBuilder::new(
                None,
                Int32Builder::new(),
                ListBuilder::new(Int32Builder::new()),
            ),
        }
    }

    /// Number of logical rows appended so far.
    pub fn len(&self) -> usize {
        self.type_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.type_ids.is_empty()
    }

    fn child_len(&self, kind: ValueKind) -> usize {
        match kind {
            ValueKind::String => self.strings.len(),
            ValueKind::Bool => self.bools.len(),
            ValueKind::BigInt => self.bigints.len(),
            ValueKind::Int32Bitmask => self.bitmasks.len(),
            ValueKind::StringList => self.string_lists.len(),
            ValueKind::Int32ToInt32ListMap => self.int32_maps.len(),
        }
    }

    /// Append one value and return its `(type id, child slot)`.
    pub fn append(&mut self, value: &TaggedValue) -> Result<(i8, i32), ArrowError> {
        let kind = value.kind();
        let slot = i32::try_from(self.child_len(kind)).map_err(|_| {
            ArrowError::InvalidArgumentError(format!("{kind:?} child exceeds i32 offsets"))
        })?;

        match value {
            TaggedValue::String(v) => self.strings.append_value(v),
            TaggedValue::Bool(v) => self.bools.append_value(*v),
            TaggedValue::BigInt(v) => self.bigints.append_value(*v),
            TaggedValue::Int32Bitmask(v) => self.bitmasks.append_value(*v),
            TaggedValue::StringList(items) => {
                for item in items {
                    self.string_lists.values().append_value(item);
                }
                self.string_lists.append(true);
            }
            TaggedValue::Int32ToInt32ListMap(entries) => {
                for (key, items) in entries {
                    self.int32_maps.keys().append_value(*key);
                    let lists = self.int32_maps.values();
                    for item in items {
                        lists.values().append_value(*item);
                    }
                    lists.append(true);
                }
                self.int32_maps.append(true)?;
            }
        }

        self.type_ids.push(kind.type_id());
        self.offsets.push(slot);
        Ok((kind.type_id(), slot))
    }

    pub fn finish(mut self) -> Result<UnionArray, ArrowError> {
        let children: Vec<ArrayRef> = vec![
            Arc::new(self.strings.finish()),
            Arc::new(self.bools.finish()),
            Arc::new(self.bigints.finish()),
            Arc::new(self.bitmasks.finish()),
            Arc::new(self.string_lists.finish()),
            Arc::new(self.int32_maps.finish()),
        ];
        UnionArray::try_new(
            value_union_fields(),
            self.type_ids.into(),
            Some(self.offsets.into()),
            children,
        )
    }
}

/// The fixed capability table for one server process.
#[derive(Debug, Clone)]
pub struct SqlInfoCatalog {
    entries: Vec<CapabilityEntry>,
}

impl SqlInfoCatalog {
    pub fn new(identity: &ServerIdentity) -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let entries = vec![
            CapabilityEntry::new(SERVER_NAME, TaggedValue::String(identity.name.clone())),
            CapabilityEntry::new(SERVER_VERSION, TaggedValue::String(identity.version.clone())),
            CapabilityEntry::new(
                SERVER_ARROW_VERSION,
                TaggedValue::String(ARROW_VERSION.to_string()),
            ),
            CapabilityEntry::new(SERVER_READ_ONLY, TaggedValue::Bool(identity.read_only)),
            CapabilityEntry::new(SERVER_TRANSACTION, TaggedValue::Int32Bitmask(TRANSACTION_NONE)),
            CapabilityEntry::new(DDL_CATALOG, TaggedValue::Bool(false)),
            CapabilityEntry::new(DDL_SCHEMA, TaggedValue::Bool(false)),
            CapabilityEntry::new(DDL_TABLE, TaggedValue::Bool(true)),
            CapabilityEntry::new(IDENTIFIER_CASE, TaggedValue::BigInt(CASE_INSENSITIVE)),
            CapabilityEntry::new(IDENTIFIER_QUOTE_CHAR, TaggedValue::String("\"".to_string())),
            CapabilityEntry::new(QUOTED_IDENTIFIER_CASE, TaggedValue::BigInt(CASE_INSENSITIVE)),
            CapabilityEntry::new(ALL_TABLES_ARE_SELECTABLE, TaggedValue::Bool(true)),
            CapabilityEntry::new(NULL_ORDERING, TaggedValue::BigInt(NULLS_SORTED_AT_START)),
            CapabilityEntry::new(KEYWORDS, TaggedValue::StringList(strings(SQL_KEYWORDS))),
            CapabilityEntry::new(
                NUMERIC_FUNCTIONS,
                TaggedValue::StringList(strings(NUMERIC_FUNCTION_NAMES)),
            ),
            CapabilityEntry::new(
                STRING_FUNCTIONS,
                TaggedValue::StringList(strings(STRING_FUNCTION_NAMES)),
            ),
            CapabilityEntry::new(
                SUPPORTS_CONVERT,
                TaggedValue::Int32ToInt32ListMap(vec![(CONVERT_BIGINT, vec![CONVERT_INTEGER])]),
            ),
        ];
        Self { entries }
    }

    pub fn entries(&self) -> &[CapabilityEntry] {
        &self.entries
    }

    pub fn get(&self, id: u32) -> Option<&TaggedValue> {
        self.entries.iter().find(|e| e.id == id).map(|e| &e.value)
    }

    pub fn schema(&self) -> SchemaRef {
        sql_info_schema()
    }

    /// Encode every entry into a single batch, in entry order.
    pub fn record_batch(&self) -> Result<RecordBatch, ArrowError> {
        let mut ids = UInt32Builder::with_capacity(self.entries.len());
        let mut values = SqlInfoUnionBuilder::new();
        for entry in &self.entries {
            ids.append_value(entry.id);
            values.append(&entry.value)?;
        }
        RecordBatch::try_new(
            sql_info_schema(),
            vec![Arc::new(ids.finish()), Arc::new(values.finish()?)],
        )
    }
}
