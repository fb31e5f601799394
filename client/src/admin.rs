//! Typed wrappers around the broker's `cellaserv` service

use crate::client::decode_json;
use crate::connection::Connection;
use crate::Result;
use bytes::Bytes;
use cellaserv::broker::{
    AdminCommand, ConnectionInfo, DescribeConnArgs, LogRotateArgs, ServiceInfo, SpyArgs,
    ADMIN_SERVICE,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct AdminClient {
    connection: Arc<Connection>,
}

impl AdminClient {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    async fn call(&self, command: AdminCommand, data: Option<Bytes>) -> Result<Option<Bytes>> {
        self.connection
            .request(ADMIN_SERVICE, None, command.as_str(), data)
            .await
    }

    async fn call_json<T, R>(&self, command: AdminCommand, args: Option<&T>) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let data = match args {
            Some(args) => Some(Bytes::from(serde_json::to_vec(args)?)),
            None => None,
        };
        decode_json(self.call(command, data).await?)
    }

    /// Give our connection a human-readable name in `list_connections`
    pub async fn describe_conn(&self, name: &str) -> Result<()> {
        let args = DescribeConnArgs {
            name: name.to_string(),
        };
        self.call_json(AdminCommand::DescribeConn, Some(&args)).await
    }

    pub async fn list_services(&self) -> Result<Vec<ServiceInfo>> {
        self.call_json::<(), _>(AdminCommand::ListServices, None).await
    }

    pub async fn list_connections(&self) -> Result<Vec<ConnectionInfo>> {
        self.call_json::<(), _>(AdminCommand::ListConnections, None)
            .await
    }

    /// Subscription patterns and the addresses of their subscribers
    pub async fn list_events(&self) -> Result<BTreeMap<String, Vec<String>>> {
        self.call_json::<(), _>(AdminCommand::ListEvents, None).await
    }

    pub async fn spy(&self, service: &str, identification: Option<&str>) -> Result<()> {
        let args = SpyArgs {
            service: service.to_string(),
            identification: identification.unwrap_or_default().to_string(),
        };
        self.call_json(AdminCommand::Spy, Some(&args)).await
    }

    /// Concatenated content of the current session's logs matching `pattern`
    pub async fn get_logs(&self, pattern: &str) -> Result<Bytes> {
        let data = Bytes::copy_from_slice(pattern.as_bytes());
        let logs = self.call(AdminCommand::GetLogs, Some(data)).await?;
        Ok(logs.unwrap_or_default())
    }

    /// Start a new log session, named after the broker's clock when `session` is `None`
    pub async fn log_rotate(&self, session: Option<&str>) -> Result<()> {
        let args = session.map(|session| LogRotateArgs {
            session: session.to_string(),
        });
        self.call_json(AdminCommand::LogRotate, args.as_ref()).await
    }

    pub async fn version(&self) -> Result<String> {
        self.call_json::<(), _>(AdminCommand::Version, None).await
    }

    /// Stop the broker. The reply is sent before the listener closes.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(AdminCommand::Shutdown, None).await?;
        Ok(())
    }
}
