//! Prost/tonic bindings for `v2ray.core.app.stats.command.StatsService`.
//!
//! Hand-maintained mirror of the upstream stats proto, limited to the
//! messages and calls the collector uses.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SysStatsRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SysStatsResponse {
    #[prost(uint32, tag = "1")]
    pub num_goroutine: u32,
    #[prost(uint32, tag = "2")]
    pub num_gc: u32,
    #[prost(uint64, tag = "3")]
    pub alloc: u64,
    #[prost(uint64, tag = "4")]
    pub total_alloc: u64,
    #[prost(uint64, tag = "5")]
    pub sys: u64,
    #[prost(uint64, tag = "6")]
    pub mallocs: u64,
    #[prost(uint64, tag = "7")]
    pub frees: u64,
    #[prost(uint64, tag = "8")]
    pub live_objects: u64,
    #[prost(uint64, tag = "9")]
    pub pause_total_ns: u64,
    #[prost(uint32, tag = "10")]
    pub uptime: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryStatsRequest {
    #[prost(string, tag = "1")]
    pub pattern: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub reset: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Stat {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub value: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryStatsResponse {
    #[prost(message, repeated, tag = "1")]
    pub stat: ::prost::alloc::vec::Vec<Stat>,
}

pub mod stats_service_client {
    use tonic::codegen::http::uri::PathAndQuery;
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct StatsServiceClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl StatsServiceClient<tonic::transport::Channel> {
        /// Attempts to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> StatsServiceClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }

        pub async fn get_sys_stats(
            &mut self,
            request: impl tonic::IntoRequest<super::SysStatsRequest>,
        ) -> Result<tonic::Response<super::SysStatsResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static(
                "/v2ray.core.app.stats.command.StatsService/GetSysStats",
            );
            self.inner.unary(request.into_request(), path, codec).await
        }

        pub async fn query_stats(
            &mut self,
            request: impl tonic::IntoRequest<super::QueryStatsRequest>,
        ) -> Result<tonic::Response<super::QueryStatsResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static(
                "/v2ray.core.app.stats.command.StatsService/QueryStats",
            );
            self.inner.unary(request.into_request(), path, codec).await
        }
    }
}
