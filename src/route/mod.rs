//! Route descriptors produced by the routing layer

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Statement type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    Select,
    Insert,
    Update,
    Delete,
    Replace,
    Call,
    LoadData,
    Ddl,
    Other,
}

impl SqlType {
    /// Classify a statement by its leading keyword
    pub fn classify(sql: &str) -> Self {
        let trimmed = sql.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        let keyword: String = trimmed
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_ascii_uppercase();

        match keyword.as_str() {
            "SELECT" | "SHOW" | "DESC" | "DESCRIBE" | "EXPLAIN" | "WITH" => SqlType::Select,
            "INSERT" => SqlType::Insert,
            "UPDATE" => SqlType::Update,
            "DELETE" => SqlType::Delete,
            "REPLACE" => SqlType::Replace,
            "CALL" => SqlType::Call,
            "LOAD" => SqlType::LoadData,
            "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "RENAME" => SqlType::Ddl,
            _ => SqlType::Other,
        }
    }

    /// Whether the statement changes data and belongs in the transaction log
    pub fn is_modify(self) -> bool {
        matches!(
            self,
            SqlType::Insert
                | SqlType::Update
                | SqlType::Delete
                | SqlType::Replace
                | SqlType::LoadData
                | SqlType::Ddl
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SqlType::Select => "select",
            SqlType::Insert => "insert",
            SqlType::Update => "update",
            SqlType::Delete => "delete",
            SqlType::Replace => "replace",
            SqlType::Call => "call",
            SqlType::LoadData => "load_data",
            SqlType::Ddl => "ddl",
            SqlType::Other => "other",
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const SLAVE_UNSET: u8 = 0;
const SLAVE_FALSE: u8 = 1;
const SLAVE_TRUE: u8 = 2;

/// One statement routed to one sharding node.
///
/// Identity (equality and hashing) is the node name, so a node keys the
/// session's connection map no matter which statement it carries.
#[derive(Debug)]
pub struct RouteNode {
    pub name: String,
    pub statement: String,
    pub sql_type: SqlType,
    run_on_slave: AtomicU8,
}

impl RouteNode {
    pub fn new(name: impl Into<String>, sql_type: SqlType, statement: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            statement: statement.into(),
            sql_type,
            run_on_slave: AtomicU8::new(SLAVE_UNSET),
        }
    }

    pub fn is_modify_sql(&self) -> bool {
        self.sql_type.is_modify()
    }

    /// Slave routing hint, `None` leaves the choice to the node
    pub fn run_on_slave(&self) -> Option<bool> {
        match self.run_on_slave.load(Ordering::Acquire) {
            SLAVE_TRUE => Some(true),
            SLAVE_FALSE => Some(false),
            _ => None,
        }
    }

    pub fn set_run_on_slave(&self, hint: Option<bool>) {
        let raw = match hint {
            Some(true) => SLAVE_TRUE,
            Some(false) => SLAVE_FALSE,
            None => SLAVE_UNSET,
        };
        self.run_on_slave.store(raw, Ordering::Release);
    }
}

impl Clone for RouteNode {
    fn clone(&self) -> Self {
        let node = Self::new(self.name.clone(), self.sql_type, self.statement.clone());
        node.set_run_on_slave(self.run_on_slave());
        node
    }
}

impl PartialEq for RouteNode {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for RouteNode {}

impl Hash for RouteNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for RouteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{{}}}", self.name, self.statement)
    }
}

/// Routing decision for one statement
#[derive(Debug, Clone)]
pub struct RouteResultset {
    pub statement: String,
    pub sql_type: SqlType,
    pub nodes: Vec<Arc<RouteNode>>,
    /// Logical schema reported in returned field metadata
    pub schema: Option<String>,
    /// Logical table reported as the field's original table
    pub table: Option<String>,
    /// Alias reported as the field's table
    pub table_alias: Option<String>,
    pub run_on_slave: Option<bool>,
    pub global_table: bool,
    /// Alternate nodes that may serve a read of a global table
    pub global_backup_nodes: Option<Vec<String>>,
    pub load_data: bool,
    pub call_statement: bool,
}

impl RouteResultset {
    pub fn new(statement: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            statement: statement.into(),
            sql_type,
            nodes: Vec::new(),
            schema: None,
            table: None,
            table_alias: None,
            run_on_slave: None,
            global_table: false,
            global_backup_nodes: None,
            load_data: sql_type == SqlType::LoadData,
            call_statement: sql_type == SqlType::Call,
        }
    }

    /// Route `statement` to a single node
    pub fn single(node: &str, statement: &str) -> Self {
        let sql_type = SqlType::classify(statement);
        let mut rrs = Self::new(statement, sql_type);
        rrs.nodes.push(Arc::new(RouteNode::new(node, sql_type, statement)));
        rrs
    }

    pub fn with_labels(
        mut self,
        schema: Option<&str>,
        table: Option<&str>,
        alias: Option<&str>,
    ) -> Self {
        self.schema = schema.map(str::to_string);
        self.table = table.map(str::to_string);
        self.table_alias = alias.map(str::to_string);
        self
    }

    pub fn with_global_backups(mut self, nodes: Vec<String>) -> Self {
        self.global_table = true;
        self.global_backup_nodes = Some(nodes);
        self
    }
}
