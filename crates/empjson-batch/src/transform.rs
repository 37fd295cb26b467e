//! Flat record -> employee document
//!
//! Pure and single-record. A failure here never fails a chunk: the step
//! counts the record as skipped and moves on.

use crate::error::TransformError;
use crate::model::{EmployeeDoc, FlatRecord, UpdateRecord};

/// Turns one source record into the update that persists its document
pub trait ItemProcessor: Send + Sync {
    fn process(&self, record: &FlatRecord) -> Result<UpdateRecord, TransformError>;
}

/// Build the nested document for a record
///
/// Addresses are appended current first, then permanent, each only when its
/// type code is set.
pub fn to_employee_doc(record: &FlatRecord) -> EmployeeDoc {
    let addresses = [&record.current, &record.permanent]
        .into_iter()
        .filter_map(|group| group.to_doc())
        .collect();

    EmployeeDoc {
        id: record.id,
        first_name: record.first_name.clone(),
        last_name: record.last_name.clone(),
        age: record.age,
        date_of_birth: record.date_of_birth,
        addresses,
    }
}

/// Default processor: document built by [`to_employee_doc`], serialized as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct EmployeeDocumentProcessor;

impl ItemProcessor for EmployeeDocumentProcessor {
    fn process(&self, record: &FlatRecord) -> Result<UpdateRecord, TransformError> {
        let doc = to_employee_doc(record);
        let document = serde_json::to_string(&doc).map_err(|source| TransformError::Serialize {
            id: record.id,
            source,
        })?;

        Ok(UpdateRecord {
            id: record.id,
            document,
        })
    }
}
