use crate::{
    config::{SEGMENT_ID_MAX_SIZE, TABLE_NAME_MAX_SIZE},
    errors,
};

pub fn validate_table_name(table: &str) -> errors::Result<()> {
    // 1. Empty String Check
    if table.is_empty() {
        return Err(errors::Errors::new(errors::ErrorCodes::TableNameIsEmpty));
    }

    // 2. Max Length Check
    if table.len() > TABLE_NAME_MAX_SIZE {
        return Err(errors::Errors::new(errors::ErrorCodes::TableNameTooLong));
    }

    // 3. All Characters are alphanumeric or underscore
    if !table.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(errors::Errors::new(errors::ErrorCodes::TableNameIsInvalid)
            .with_message(table.to_string()));
    }

    Ok(())
}

// Segment ids end up in file names (`<id>_<ts>.segment`), so `_`, `.` and separators are out.
pub fn validate_segment_id(segment_id: &str) -> errors::Result<()> {
    if segment_id.is_empty() || segment_id.len() > SEGMENT_ID_MAX_SIZE {
        return Err(errors::Errors::new(errors::ErrorCodes::SegmentIdIsInvalid)
            .with_message(format!("invalid segment id length: '{}'", segment_id)));
    }

    if !segment_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(errors::Errors::new(errors::ErrorCodes::SegmentIdIsInvalid)
            .with_message(segment_id.to_string()));
    }

    Ok(())
}

// Partition values are `column=value`; the location joins them with `/`.
pub fn validate_partition_values(values: &[String]) -> errors::Result<()> {
    for value in values {
        let valid = match value.split_once('=') {
            Some((column, val)) => {
                !column.is_empty()
                    && !val.is_empty()
                    && !value.contains('/')
                    && !value.contains("..")
            }
            None => false,
        };

        if !valid {
            return Err(errors::Errors::new(errors::ErrorCodes::PartitionIsInvalid)
                .with_message(value.clone()));
        }
    }

    Ok(())
}

// Task ids name fragment files (`<task>.fragment`) and data files.
pub fn validate_task_id(task_id: &str) -> errors::Result<()> {
    if task_id.is_empty()
        || task_id.len() > SEGMENT_ID_MAX_SIZE
        || !task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(errors::Errors::new(errors::ErrorCodes::TaskIdIsInvalid)
            .with_message(task_id.to_string()));
    }

    Ok(())
}
