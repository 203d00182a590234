//! `DBService` implementation over a shared [`Gateway`].

use std::pin::Pin;
use std::sync::Arc;

use pgrelay_core::{Gateway, NotificationEvent, QueryRequest};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};

use crate::proto::{ChannelRequest, ChannelResponse, DbService, StoredProcRequest, StoredProcResponse};
use crate::status::into_status;

type ChannelStream = Pin<Box<dyn Stream<Item = Result<ChannelResponse, Status>> + Send>>;

pub struct DbServiceImpl {
    gateway: Arc<Gateway>,
}

impl DbServiceImpl {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

impl From<NotificationEvent> for ChannelResponse {
    fn from(event: NotificationEvent) -> Self {
        Self {
            channel_name: event.channel_name,
            data: event.data,
            timestamp: event.timestamp,
        }
    }
}

#[tonic::async_trait]
impl DbService for DbServiceImpl {
    type ListenToChannelStream = ChannelStream;

    async fn execute_query(
        &self,
        request: Request<StoredProcRequest>,
    ) -> Result<Response<StoredProcResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .gateway
            .execute_query(&QueryRequest::new(req.query, req.params))
            .await
            .map_err(into_status)?;

        Ok(Response::new(StoredProcResponse {
            result: result.rows_json(),
            row_count: i32::try_from(result.row_count).unwrap_or(i32::MAX),
            command: result.command_tag,
        }))
    }

    async fn listen_to_channel(
        &self,
        request: Request<ChannelRequest>,
    ) -> Result<Response<Self::ListenToChannelStream>, Status> {
        let req = request.into_inner();
        let (subscription, events) = self
            .gateway
            .listen(&req.channel_name)
            .await
            .map_err(into_status)?;

        tracing::info!(
            listener_id = %subscription.listener_id,
            channel = %subscription.channel,
            "client subscribed"
        );

        // Dropping the response stream drops the receiver, which the relay
        // observes as client cancellation.
        let stream = ReceiverStream::new(events).map(|event| Ok(ChannelResponse::from(event)));
        Ok(Response::new(Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgrelay_core::{ConnectionPool, DatabaseConfig, GatewayConfig, PoolConfig, RelayConfig};
    use std::time::Duration;
    use tonic::Code;

    fn offline_service() -> (DbServiceImpl, Arc<Gateway>) {
        let config = GatewayConfig {
            database: DatabaseConfig {
                host: "127.0.0.1".into(),
                user: "nobody".into(),
                password: String::new(),
                database: "nothing".into(),
                port: 1,
                pool: PoolConfig {
                    min: 0,
                    max: 1,
                    idle_timeout: Duration::from_secs(30),
                    acquire_timeout: Duration::from_millis(300),
                },
            },
            port: 0,
            relay: RelayConfig::default(),
            shutdown_timeout: Duration::from_secs(1),
        };
        let pool = Arc::new(ConnectionPool::connect_lazy(&config.database));
        let gateway = Arc::new(Gateway::new(pool, &config));
        (DbServiceImpl::new(Arc::clone(&gateway)), gateway)
    }

    #[tokio::test]
    async fn empty_query_is_invalid_argument() {
        let (service, _) = offline_service();

        let status = service
            .execute_query(Request::new(StoredProcRequest {
                query: String::new(),
                params: vec![],
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "query must be a non-empty string");
    }

    #[tokio::test]
    async fn malformed_channel_is_invalid_argument_without_a_connection() {
        let (service, gateway) = offline_service();

        let result = service
            .listen_to_channel(Request::new(ChannelRequest {
                channel_name: "bad;name".into(),
            }))
            .await;
        let status = match result {
            Err(status) => status,
            Ok(_) => panic!("malformed channel accepted"),
        };

        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(gateway.pool_status().size, 0);
    }

    #[tokio::test]
    async fn unreachable_database_is_internal() {
        let (service, _) = offline_service();

        let status = service
            .execute_query(Request::new(StoredProcRequest {
                query: "SELECT 1".into(),
                params: vec![],
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::Internal);
    }

    #[test]
    fn notification_maps_payload_to_data() {
        let response = ChannelResponse::from(NotificationEvent {
            channel_name: "orders".into(),
            data: r#""{\"id\":1}""#.into(),
            timestamp: "2024-01-01T00:00:00.000Z".into(),
        });
        assert_eq!(response.channel_name, "orders");
        assert_eq!(response.data, r#""{\"id\":1}""#);
        assert_eq!(response.timestamp, "2024-01-01T00:00:00.000Z");
    }
}
