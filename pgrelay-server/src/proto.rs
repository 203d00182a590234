//! `DB` protobuf messages and the `DBService` stubs, generated from
//! `proto/db.proto`.

tonic::include_proto!("DB");

pub use self::db_service_client::DbServiceClient;
pub use self::db_service_server::{DbService, DbServiceServer};
