mod versioned_schema;

pub use versioned_schema::{
    read_db_version, Column, SchemaError, SqlType, Table, VersionedSchema, BASE_DB_VERSION,
};
