/*
 * Copyright 2020 Joyent, Inc.
 */

//! A request handler that reports the server version of a local PostgreSQL
//! instance, using a bounded pool of connections.
//!
//! Each request acquires a connection for the length of one query. The
//! connection goes back to the pool when the handle falls out of scope,
//! whether the query succeeded or not.

use std::sync::Mutex;
use std::thread;

use slog::{error, info, o, Drain, Logger};

use resilient_pool::bounded_pool::types::BoundedPoolOptions;
use resilient_pool::bounded_pool::BoundedPool;
use resilient_pool::error::Error;
use resilient_pool_postgres_connection::{
    PostgresConnection, PostgresConnectionConfig, PostgresConnectionError,
    TlsConfig,
};

#[derive(Debug)]
enum Response {
    Ok(String),
    ServiceUnavailable(String),
    InternalError(String),
}

fn pg_version<F>(
    pool: &BoundedPool<PostgresConnection, F>,
    log: &Logger,
) -> Response
where
    F: Fn() -> PostgresConnection + Send + Sync + 'static,
{
    let mut conn = match pool.acquire() {
        Ok(conn) => conn,
        Err(Error::PoolExhaustion(waited)) => {
            error!(log, "no connection available"; "waited" => ?waited);
            return Response::ServiceUnavailable("database busy".into());
        }
        Err(e) => {
            error!(log, "failed to acquire connection"; "err" => %e);
            return Response::ServiceUnavailable(e.to_string());
        }
    };

    let result = conn
        .client()
        .and_then(|client| {
            client
                .query_one("SELECT version()", &[])
                .map_err(PostgresConnectionError::from)
        })
        .map(|row| row.get::<_, String>(0));

    match result {
        Ok(version) => Response::Ok(version),
        Err(e) => {
            error!(log, "query failed"; "err" => %e);
            Response::InternalError(e.to_string())
        }
    }
}

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let pg_config = PostgresConnectionConfig {
        user: Some("postgres".into()),
        password: None,
        host: None,
        port: Some(5432),
        database: Some("test".into()),
        application_name: Some("pg-version".into()),
        connect_timeout: Some(2000),
        tls_config: TlsConfig::Disable,
    };
    let pool_opts = BoundedPoolOptions {
        pool_size: Some(2),
        max_overflow: Some(2),
        acquire_timeout: Some(5000),
        pre_ping: true,
        retry_policy: None,
        log: Some(log.clone()),
    };

    let pool = BoundedPool::new(
        pool_opts,
        PostgresConnection::connection_creator(pg_config),
    );

    let requests: Vec<_> = (0..8)
        .map(|request| {
            let pool = pool.clone();
            let log = log.new(o!("request" => request));
            thread::spawn(move || {
                let response = pg_version(&pool, &log);
                info!(log, "response"; "body" => ?response);
            })
        })
        .collect();

    for request in requests {
        let _ = request.join();
    }

    if let Err(e) = pool.stop() {
        error!(log, "failed to stop pool"; "err" => %e);
    }
}
