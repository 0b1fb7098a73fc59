//! Connect with a connection string and run a parameterized query.
//!
//! # Running
//!
//! ```bash
//! export TDSWIRE_CONNECTION="Server=localhost,1433;User Id=sa;Password=YourStrong@Passw0rd;TrustServerCertificate=true"
//! RUST_LOG=tdswire_client=debug cargo run --example query
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use tdswire_client::{Config, Connection, Error, RpcParam};
use tdswire_types::SqlValue;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let conn_str = std::env::var("TDSWIRE_CONNECTION").unwrap_or_else(|_| {
        "Server=localhost,1433;User Id=sa;Password=Password123!;TrustServerCertificate=true".into()
    });
    let config = Config::from_connection_string(&conn_str)?;
    let mut conn = Connection::connect(config).await?;
    println!(
        "connected to {} (TDS {}), database {}",
        conn.server_name().unwrap_or("?"),
        conn.tds_version(),
        conn.database().unwrap_or("?")
    );

    let response = conn
        .execute_sql(
            "SELECT name FROM sys.databases WHERE database_id <= @max",
            vec![RpcParam::infer("@max", SqlValue::Int(4))],
        )
        .await?;
    if let Some(set) = response.first() {
        for row in &set.rows {
            println!("{:?}", row.get(0));
        }
    }

    let cancel_demo = conn.cancel_handle();
    let waiter = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        cancel_demo.cancel()
    });
    match conn.exec_sql_batch("WAITFOR DELAY '00:00:05'").await {
        Err(e) => println!("waitfor ended: {e}"),
        Ok(_) => println!("waitfor completed"),
    }
    println!("cancel delivered: {}", waiter.await.unwrap());

    conn.close().await;
    Ok(())
}
