//! Record model
//!
//! One flat row of the source view in, one nested employee document out.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, Row};

/// One embedded address group of a flat row
///
/// The group is present iff `type_code` is set; the other columns are taken
/// as they come.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressGroup {
    pub type_code: Option<String>,
    pub line_one: Option<String>,
    pub line_two: Option<String>,
    pub zip: Option<i32>,
}

impl AddressGroup {
    pub fn is_present(&self) -> bool {
        self.type_code.is_some()
    }

    /// Document form of the group, `None` when the group is absent
    pub fn to_doc(&self) -> Option<AddressDoc> {
        self.type_code.as_ref().map(|type_code| AddressDoc {
            type_code: type_code.clone(),
            line_one: self.line_one.clone(),
            line_two: self.line_two.clone(),
            zip: self.zip,
        })
    }
}

/// One row of the source view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatRecord {
    pub id: i32,
    pub segment: i32,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub age: Option<i32>,
    pub date_of_birth: Option<NaiveDate>,
    pub current: AddressGroup,
    pub permanent: AddressGroup,
}

impl FlatRecord {
    /// Column list read by [`FromRow`], in select order
    pub const COLUMNS: &'static [&'static str] = &[
        "id",
        "segment",
        "first_name",
        "last_name",
        "age",
        "date_of_birth",
        "cur_type_code",
        "cur_line_one",
        "cur_line_two",
        "cur_zip",
        "per_type_code",
        "per_line_one",
        "per_line_two",
        "per_zip",
    ];
}

impl<'r> FromRow<'r, PgRow> for FlatRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            segment: row.try_get("segment")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            age: row.try_get("age")?,
            date_of_birth: row.try_get("date_of_birth")?,
            current: AddressGroup {
                type_code: row.try_get("cur_type_code")?,
                line_one: row.try_get("cur_line_one")?,
                line_two: row.try_get("cur_line_two")?,
                zip: row.try_get("cur_zip")?,
            },
            permanent: AddressGroup {
                type_code: row.try_get("per_type_code")?,
                line_one: row.try_get("per_line_one")?,
                line_two: row.try_get("per_line_two")?,
                zip: row.try_get("per_zip")?,
            },
        })
    }
}

/// Address entry of the output document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressDoc {
    pub type_code: String,
    pub line_one: Option<String>,
    pub line_two: Option<String>,
    pub zip: Option<i32>,
}

/// The nested document persisted into the target column
///
/// Serializes to exactly `id, firstName, lastName, age, dateOfBirth,
/// addresses`; missing values are written as `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmployeeDoc {
    pub id: i32,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub age: Option<i32>,
    pub date_of_birth: Option<NaiveDate>,
    /// Current address first, then permanent
    pub addresses: Vec<AddressDoc>,
}

/// Unit persisted by the writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord {
    pub id: i32,
    pub document: String,
}

/// Scope of one step execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    pub name: String,
    pub segment: i32,
}

impl PartitionDescriptor {
    pub fn new(index: usize, segment: i32) -> Self {
        Self {
            name: format!("partition{index}"),
            segment,
        }
    }
}
