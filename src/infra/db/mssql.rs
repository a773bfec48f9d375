//! SQL Server connections over TDS.

use async_trait::async_trait;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time};
use tiberius::{Client, ColumnData, Config, FromSql, Query, error::Error};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::info;

use crate::application::repos::DbError;
use crate::domain::table::{CellValue, ResultSet, Row};
use crate::domain::types::SqlValue;
use crate::infra::error::InfraError;

use super::util::map_tiberius_error;
use super::{Connector, DbConnection};

pub struct MssqlConnector {
    config: Config,
}

impl MssqlConnector {
    /// Parse an ADO.NET style connection string.
    pub fn from_ado_string(connection_string: &str) -> Result<Self, InfraError> {
        let config = Config::from_ado_string(connection_string).map_err(|err| {
            InfraError::configuration(format!("invalid database connection string: {err}"))
        })?;
        Ok(Self { config })
    }
}

#[async_trait]
impl Connector for MssqlConnector {
    async fn connect(&self) -> Result<Box<dyn DbConnection>, DbError> {
        let client = match open(self.config.clone()).await {
            Err(Error::Routing { host, port }) => {
                info!(
                    target = "dashcache::infra::db::mssql",
                    host = %host,
                    port,
                    "Following server routing redirect"
                );
                let mut config = self.config.clone();
                config.host(&host);
                config.port(port);
                open(config).await
            }
            other => other,
        }
        .map_err(map_tiberius_error)?;

        Ok(Box::new(MssqlConnection { client }))
    }
}

async fn open(config: Config) -> Result<Client<Compat<TcpStream>>, Error> {
    let tcp = TcpStream::connect(config.get_addr()).await?;
    tcp.set_nodelay(true)?;
    Client::connect(config, tcp.compat_write()).await
}

struct MssqlConnection {
    client: Client<Compat<TcpStream>>,
}

#[async_trait]
impl DbConnection for MssqlConnection {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<ResultSet, DbError> {
        let mut query = Query::new(sql.to_string());
        for value in params {
            bind(&mut query, value);
        }

        let mut stream = query
            .query(&mut self.client)
            .await
            .map_err(map_tiberius_error)?;
        let columns: Vec<String> = stream
            .columns()
            .await
            .map_err(map_tiberius_error)?
            .map(|columns| {
                columns
                    .iter()
                    .map(|column| column.name().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let rows = stream
            .into_first_result()
            .await
            .map_err(map_tiberius_error)?;

        let rows = rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(cell_value)
                    .collect::<Result<Vec<_>, _>>()
                    .map(Row::new)
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_tiberius_error)?;

        ResultSet::new(columns, rows).map_err(|err| DbError::fatal(None, err.to_string()))
    }
}

fn bind(query: &mut Query<'_>, value: &SqlValue) {
    match value {
        SqlValue::Null => query.bind(Option::<i32>::None),
        SqlValue::Bool(value) => query.bind(*value),
        SqlValue::Int(value) => query.bind(*value),
        SqlValue::Float(value) => query.bind(*value),
        SqlValue::Text(value) => query.bind(value.clone()),
        SqlValue::Timestamp(value) => query.bind(*value),
    }
}

fn cell_value(data: ColumnData<'static>) -> Result<CellValue, Error> {
    let cell = match &data {
        ColumnData::U8(value) => value.map(|v| CellValue::Int(i64::from(v))),
        ColumnData::I16(value) => value.map(|v| CellValue::Int(i64::from(v))),
        ColumnData::I32(value) => value.map(|v| CellValue::Int(i64::from(v))),
        ColumnData::I64(value) => value.map(CellValue::Int),
        ColumnData::F32(value) => value.map(|v| CellValue::Float(f64::from(v))),
        ColumnData::F64(value) => value.map(CellValue::Float),
        ColumnData::Bit(value) => value.map(CellValue::Bool),
        ColumnData::String(value) => value.as_ref().map(|v| CellValue::Text(v.to_string())),
        ColumnData::Guid(value) => value.as_ref().map(|v| CellValue::Text(v.to_string())),
        ColumnData::Binary(value) => value.as_ref().map(|v| CellValue::Text(hex::encode(v))),
        ColumnData::Numeric(value) => value.as_ref().map(|v| {
            CellValue::Float(v.value() as f64 / 10f64.powi(i32::from(v.scale())))
        }),
        ColumnData::Xml(value) => value
            .as_ref()
            .map(|v| CellValue::Text(v.as_ref().clone().into_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            PrimitiveDateTime::from_sql(&data)?.map(CellValue::DateTime)
        }
        ColumnData::Date(_) => Date::from_sql(&data)?.map(CellValue::Date),
        ColumnData::Time(_) => Time::from_sql(&data)?.map(CellValue::Time),
        ColumnData::DateTimeOffset(_) => {
            OffsetDateTime::from_sql(&data)?.map(CellValue::DateTimeOffset)
        }
    };
    Ok(cell.unwrap_or(CellValue::Null))
}
