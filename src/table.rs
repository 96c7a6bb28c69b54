use std::path::PathBuf;

use crate::{
    config::TABLES_DIRECTORY,
    errors::{self, ErrorCodes, Errors},
    validate::{validate_partition_values, validate_table_name},
};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TableInfo {
    pub name: String,
    #[serde(default)]
    pub partition_columns: Vec<String>,
}

// A resolved table: its name and the root every segment path hangs off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHandle {
    pub name: String,
    pub root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TableCatalog {
    base_path: PathBuf,
}

impl TableCatalog {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn tables_path(&self) -> PathBuf {
        self.base_path.join(TABLES_DIRECTORY)
    }

    fn table_info_path(&self, table: &str) -> PathBuf {
        self.tables_path().join(format!("{}.json", table))
    }

    pub async fn initialize(&self) -> errors::Result<()> {
        let tables_path = self.tables_path();

        if !tables_path.exists() {
            tokio::fs::create_dir_all(&tables_path).await.map_err(|e| {
                Errors::new(ErrorCodes::TableCreationError)
                    .with_message(format!("Failed to create tables directory: {}", e))
            })?;
        }

        Ok(())
    }

    pub async fn list_tables(&self) -> errors::Result<Vec<String>> {
        let mut table_names = Vec::new();

        let mut dir_entries = tokio::fs::read_dir(self.tables_path()).await.map_err(|e| {
            Errors::new(ErrorCodes::TableListFailed)
                .with_message(format!("Failed to read tables directory: {}", e))
        })?;

        while let Some(entry) = dir_entries.next_entry().await.map_err(|e| {
            Errors::new(ErrorCodes::TableListFailed)
                .with_message(format!("Failed to read table entry: {}", e))
        })? {
            let file_name = entry.file_name();
            if let Some(name_str) = file_name.to_str()
                && name_str.ends_with(".json")
            {
                table_names.push(name_str.trim_end_matches(".json").to_string());
            }
        }

        table_names.sort();

        Ok(table_names)
    }

    pub async fn get_table(&self, table: &str) -> errors::Result<TableInfo> {
        validate_table_name(table)?;

        let table_info_bytes = tokio::fs::read(self.table_info_path(table))
            .await
            .map_err(|e| {
                Errors::new(ErrorCodes::TableNotFound)
                    .with_message(format!("Failed to read table file of '{}': {}", table, e))
            })?;

        serde_json::from_slice(&table_info_bytes).map_err(|e| {
            Errors::new(ErrorCodes::TableGetFailed)
                .with_message(format!("Failed to deserialize table info: {}", e))
        })
    }

    pub async fn open(&self, table: &str) -> errors::Result<TableHandle> {
        let info = self.get_table(table).await?;

        Ok(TableHandle {
            root: self.tables_path().join(&info.name),
            name: info.name,
        })
    }

    pub async fn create_table(
        &self,
        table: &str,
        partition_columns: Vec<String>,
    ) -> errors::Result<TableInfo> {
        validate_table_name(table)?;
        // a column must be usable as the left side of `column=value`
        let probe: Vec<String> = partition_columns
            .iter()
            .map(|column| format!("{}=x", column))
            .collect();
        validate_partition_values(&probe)?;

        // 1. Create table info file
        let table_info_path = self.table_info_path(table);

        if table_info_path.exists() {
            return Err(Errors::new(ErrorCodes::TableAlreadyExists)
                .with_message(format!("Table '{}' already exists", table)));
        }

        let table_info = TableInfo {
            name: table.to_string(),
            partition_columns,
        };

        let table_info_json = serde_json::to_string_pretty(&table_info).map_err(|e| {
            Errors::new(ErrorCodes::TableCreationError)
                .with_message(format!("Failed to serialize table info to JSON: {}", e))
        })?;

        tokio::fs::write(&table_info_path, table_info_json)
            .await
            .map_err(|e| {
                Errors::new(ErrorCodes::TableCreationError)
                    .with_message(format!("Failed to write table info to file: {}", e))
            })?;

        // 2. Create table root
        let table_root = self.tables_path().join(table);
        if !table_root.exists() {
            tokio::fs::create_dir_all(&table_root).await.map_err(|e| {
                Errors::new(ErrorCodes::TableCreationError)
                    .with_message(format!("Failed to create table directory: {}", e))
            })?;
        }

        log::info!("Created table {}", table);

        Ok(table_info)
    }

    // Removes the table info file and every segment of the table.
    // No error occurs if the table does not exist.
    pub async fn delete_table(&self, table: &str) -> errors::Result<()> {
        validate_table_name(table)?;

        let table_info_path = self.table_info_path(table);
        if table_info_path.exists() {
            tokio::fs::remove_file(&table_info_path)
                .await
                .map_err(|e| {
                    Errors::new(ErrorCodes::FileDeleteError)
                        .with_message(format!("Failed to delete table info file: {}", e))
                })?;
        }

        let table_root = self.tables_path().join(table);
        if table_root.exists() {
            tokio::fs::remove_dir_all(&table_root).await.map_err(|e| {
                Errors::new(ErrorCodes::FileDeleteError)
                    .with_message(format!("Failed to delete table directory: {}", e))
            })?;
        }

        log::info!("Deleted table {}", table);

        Ok(())
    }
}
