use tiberius::error::Error;

use crate::application::repos::DbError;

/// SQL Server error numbers worth retrying: deadlock victim, Azure SQL
/// throttling and failover, database unavailable, and transport failures.
const TRANSIENT_SERVER_CODES: &[u32] = &[
    1205, 40197, 40501, 40613, 49918, 49919, 49920, 10928, 10929, 4060, 4221, 233, 10053, 10054,
    10060, 64, 20,
];

pub fn is_transient_server_code(code: u32) -> bool {
    TRANSIENT_SERVER_CODES.contains(&code)
}

pub fn map_tiberius_error(err: Error) -> DbError {
    match err {
        Error::Server(token) => {
            let code = token.code();
            let message = token.message().to_string();
            if is_transient_server_code(code) {
                DbError::transient(Some(code), message)
            } else {
                DbError::fatal(Some(code), message)
            }
        }
        Error::Io { message, .. } => DbError::connection(message),
        Error::Tls(message) => DbError::connection(format!("tls: {message}")),
        Error::Protocol(message) => DbError::connection(format!("protocol: {message}")),
        Error::Routing { host, port } => {
            DbError::connection(format!("server redirected to {host}:{port}"))
        }
        other => DbError::fatal(None, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlocks_and_throttling_are_transient() {
        assert!(is_transient_server_code(1205));
        assert!(is_transient_server_code(40501));
        assert!(!is_transient_server_code(18456));
        assert!(!is_transient_server_code(2812));
    }

    #[test]
    fn transport_failures_map_to_connection_errors() {
        let err = map_tiberius_error(Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )));
        assert_eq!(err.kind(), "connection");
        assert!(err.is_transient());

        let err = map_tiberius_error(Error::Tls("handshake failed".to_string()));
        assert_eq!(err, DbError::connection("tls: handshake failed"));
    }

    #[test]
    fn conversion_failures_are_fatal() {
        let err = map_tiberius_error(Error::Conversion("cannot interpret i64 as bit".into()));
        assert!(!err.is_transient());
        assert_eq!(err.kind(), "query");
    }
}
