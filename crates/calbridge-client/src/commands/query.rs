//! One-shot calls against a running daemon.

use calbridge_server::CALENDAR_SERVICE;
use serde_json::{Value, json};

use crate::bridge::BridgeClient;
use crate::error::{ClientError, ClientResult};

use super::print_json;

pub async fn status(client: &BridgeClient) -> ClientResult<()> {
    let status = client.send(CALENDAR_SERVICE, "status", Vec::new()).await?;
    print_json(&status)
}

pub async fn get(client: &BridgeClient, kind: &str, id: &str) -> ClientResult<()> {
    let record = client
        .send(CALENDAR_SERVICE, "get", vec![json!(kind), json!(id)])
        .await?;
    if record.is_null() {
        return Err(ClientError::NotFound(format!("{} '{}'", kind, id)));
    }
    print_json(&record)
}

pub async fn list(client: &BridgeClient, kind: &str) -> ClientResult<()> {
    let records = client.send(CALENDAR_SERVICE, "list", vec![json!(kind)]).await?;
    print_json(&records)
}

pub async fn cancel(client: &BridgeClient, account: &str) -> ClientResult<()> {
    let cancelled: bool = client
        .call(CALENDAR_SERVICE, "cancelSync", vec![Value::from(account)])
        .await?;
    if cancelled {
        println!("Cancelled sync of '{}'.", account);
    } else {
        println!("No sync of '{}' is running.", account);
    }
    Ok(())
}
