//! The discovery transport: one bidirectional ADS stream per connection.
//!
//! The session only ever sees a [Connect] implementation. Opening a stream
//! hands over the outbound request stream and gets back the inbound
//! response stream; the session owns everything about retrying.

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::Endpoint;
use tracing::debug;
use xds_api::pb::envoy::service::discovery::v3::{
    aggregated_discovery_service_client::AggregatedDiscoveryServiceClient, DiscoveryRequest,
    DiscoveryResponse,
};

use crate::config::ClientConfig;
use crate::xds::SessionError;

/// Outbound discovery requests, fed by the session.
pub type RequestStream = UnboundedReceiverStream<DiscoveryRequest>;

/// Inbound discovery responses. A stream that ends or yields an error is
/// done; nothing else is read from it.
pub type ResponseStream = BoxStream<'static, Result<DiscoveryResponse, tonic::Status>>;

/// Opens ADS streams.
///
/// `connect` is called once on first use and again for every reconnect. A
/// failure is treated as transient.
#[tonic::async_trait]
pub trait Connect: Send + Sync + 'static {
    async fn connect(&self, requests: RequestStream) -> Result<ResponseStream, SessionError>;
}

/// A [Connect] that opens `StreamAggregatedResources` on a tonic channel.
///
/// A new channel is created for every stream so that a control plane that
/// moved (DNS, pod restart) is picked up on reconnect.
#[derive(Clone, Debug)]
pub struct TonicConnector {
    endpoint: Endpoint,
    metadata: Vec<(AsciiMetadataKey, AsciiMetadataValue)>,
}

impl TonicConnector {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            metadata: config.metadata.clone(),
        }
    }
}

#[tonic::async_trait]
impl Connect for TonicConnector {
    async fn connect(&self, requests: RequestStream) -> Result<ResponseStream, SessionError> {
        debug!(uri = %self.endpoint.uri(), "connecting to control plane");
        let channel = self.endpoint.connect().await?;
        let mut client = AggregatedDiscoveryServiceClient::new(channel);

        let mut request = tonic::Request::new(requests);
        for (key, value) in &self.metadata {
            request.metadata_mut().insert(key.clone(), value.clone());
        }

        let responses = client.stream_aggregated_resources(request).await?;
        Ok(responses.into_inner().boxed())
    }
}

/// Find the io::Error at the bottom of a Status, if there is one. Used to
/// tell a dropped connection apart from a control plane that's actually
/// unhappy with us.
pub(crate) fn io_source(status: &tonic::Status) -> Option<&std::io::Error> {
    let mut err: &(dyn std::error::Error + 'static) = status;

    loop {
        if let Some(e) = err.downcast_ref::<std::io::Error>() {
            return Some(e);
        }

        if let Some(e) = err.downcast_ref::<h2::Error>().and_then(|e| e.get_io()) {
            return Some(e);
        }

        err = err.source()?;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_io_source() {
        let status = tonic::Status::unavailable("nope");
        assert!(io_source(&status).is_none());

        let status = tonic::Status::from_error(Box::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert_eq!(
            io_source(&status).map(|e| e.kind()),
            Some(std::io::ErrorKind::ConnectionReset)
        );
    }
}
