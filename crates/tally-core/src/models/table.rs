//! Syncable tables and the schema metadata that drives generic row SQL.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

use super::record::ID_COLUMN;

/// Column list and key column of a table, shared by local and remote sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    pub key: &'static str,
    pub columns: &'static [&'static str],
    /// Optional tables may be absent on the remote service.
    pub optional: bool,
}

impl TableSchema {
    /// Whether `column` belongs to this table.
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains(&column)
    }
}

const SETTING: TableSchema = TableSchema {
    name: "setting",
    key: ID_COLUMN,
    columns: &[
        "id",
        "company_name",
        "company_address",
        "company_email",
        "currency",
        "tax_rate",
        "data_root",
        "last_sync_at",
        "created_at",
        "updated_at",
    ],
    optional: true,
};

const CLIENT: TableSchema = TableSchema {
    name: "client",
    key: ID_COLUMN,
    columns: &[
        "id",
        "name",
        "email",
        "phone",
        "address",
        "notes",
        "created_at",
        "updated_at",
    ],
    optional: false,
};

const INVOICE: TableSchema = TableSchema {
    name: "invoice",
    key: ID_COLUMN,
    columns: &[
        "id",
        "client_id",
        "number",
        "status",
        "issue_date",
        "due_date",
        "currency",
        "total",
        "file_path",
        "notes",
        "created_at",
        "updated_at",
    ],
    optional: false,
};

const EXPENSE: TableSchema = TableSchema {
    name: "expense",
    key: ID_COLUMN,
    columns: &[
        "id",
        "invoice_id",
        "category",
        "description",
        "amount",
        "currency",
        "spent_on",
        "receipt_path",
        "created_at",
        "updated_at",
    ],
    optional: false,
};

const AUTOMATION: TableSchema = TableSchema {
    name: "automation",
    key: ID_COLUMN,
    columns: &[
        "id",
        "expense_id",
        "invoice_id",
        "kind",
        "schedule",
        "payload",
        "created_at",
        "updated_at",
    ],
    optional: true,
};

/// A table the sync engine knows how to move between sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTable {
    Setting,
    Client,
    Invoice,
    Expense,
    Automation,
}

impl SyncTable {
    /// Record tables reconciled by `full` and the merge strategies, parents first.
    pub const RECORDS: [Self; 3] = [Self::Client, Self::Invoice, Self::Expense];

    /// Local delete order for `force_pull` (children before parents).
    pub const FORCE_PULL_DELETE_ORDER: [Self; 5] = [
        Self::Automation,
        Self::Expense,
        Self::Invoice,
        Self::Client,
        Self::Setting,
    ];

    /// Local reinsert order for `force_pull` (parents before children).
    pub const FORCE_PULL_INSERT_ORDER: [Self; 4] =
        [Self::Setting, Self::Client, Self::Invoice, Self::Expense];

    /// Remote delete order for `force_push` (children before parents).
    pub const FORCE_PUSH_DELETE_ORDER: [Self; 4] =
        [Self::Automation, Self::Expense, Self::Invoice, Self::Client];

    /// Remote insert order for `force_push` (parents before children).
    pub const FORCE_PUSH_INSERT_ORDER: [Self; 3] = Self::RECORDS;

    pub const fn schema(self) -> &'static TableSchema {
        match self {
            Self::Setting => &SETTING,
            Self::Client => &CLIENT,
            Self::Invoice => &INVOICE,
            Self::Expense => &EXPENSE,
            Self::Automation => &AUTOMATION,
        }
    }

    pub const fn name(self) -> &'static str {
        self.schema().name
    }

    pub const fn is_optional(self) -> bool {
        self.schema().optional
    }
}

impl fmt::Display for SyncTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SyncTable {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "setting" => Ok(Self::Setting),
            "client" => Ok(Self::Client),
            "invoice" => Ok(Self::Invoice),
            "expense" => Ok(Self::Expense),
            "automation" => Ok(Self::Automation),
            other => Err(Error::InvalidInput(format!("Unknown sync table '{other}'"))),
        }
    }
}
