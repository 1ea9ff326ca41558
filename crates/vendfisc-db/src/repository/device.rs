//! # Fiscal Device Repository
//!
//! Registry of tax terminals: lookup, admin status changes, soft retire.
//!
//! ```text
//! register ──► ACTIVE ◄──► INACTIVE / MAINTENANCE / ERROR
//!                 │
//!                 └──► retire (retired_at set, status INACTIVE, forever)
//! ```
//!
//! Devices are never deleted: shifts and receipts keep referencing them.

use chrono::{DateTime, NaiveTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use super::{from_millis, opt_from_millis, to_millis};
use crate::error::{DbError, DbResult};
use vendfisc_core::{Credentials, DeviceStatus, FiscalDevice, ProviderMode};

const DEVICE_COLUMNS: &str = "id, organization_id, name, provider, credentials, mode, status, \
     auto_open_shift, auto_close_shift, open_at, close_at, default_cashier, \
     retired_at, created_at, updated_at";

const TIME_FORMAT: &str = "%H:%M:%S";

/// Registration input.
#[derive(Debug, Clone)]
pub struct NewDevice {
    pub organization_id: String,
    pub name: String,
    pub provider: String,
    pub credentials: Credentials,
    pub mode: ProviderMode,
    pub status: DeviceStatus,
    pub auto_open_shift: bool,
    pub auto_close_shift: bool,
    pub open_at: Option<NaiveTime>,
    pub close_at: Option<NaiveTime>,
    pub default_cashier: String,
}

impl NewDevice {
    /// An active sandbox device with manual shifts.
    pub fn sandbox(organization_id: impl Into<String>, name: impl Into<String>) -> Self {
        NewDevice {
            organization_id: organization_id.into(),
            name: name.into(),
            provider: "sandbox".to_string(),
            credentials: Credentials::default(),
            mode: ProviderMode::Sandbox,
            status: DeviceStatus::Active,
            auto_open_shift: false,
            auto_close_shift: false,
            open_at: None,
            close_at: None,
            default_cashier: "Vending Machine".to_string(),
        }
    }

    pub fn with_auto_shifts(mut self, open_at: Option<NaiveTime>, close_at: Option<NaiveTime>) -> Self {
        self.auto_open_shift = true;
        self.auto_close_shift = true;
        self.open_at = open_at;
        self.close_at = close_at;
        self
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: String,
    organization_id: String,
    name: String,
    provider: String,
    credentials: Vec<u8>,
    mode: ProviderMode,
    status: DeviceStatus,
    auto_open_shift: bool,
    auto_close_shift: bool,
    open_at: Option<String>,
    close_at: Option<String>,
    default_cashier: String,
    retired_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

fn parse_time(value: Option<String>) -> DbResult<Option<NaiveTime>> {
    value
        .map(|v| {
            NaiveTime::parse_from_str(&v, TIME_FORMAT)
                .map_err(|e| DbError::Internal(format!("invalid time of day '{v}': {e}")))
        })
        .transpose()
}

fn format_time(value: Option<NaiveTime>) -> Option<String> {
    value.map(|t| t.format(TIME_FORMAT).to_string())
}

impl TryFrom<DeviceRow> for FiscalDevice {
    type Error = DbError;

    fn try_from(row: DeviceRow) -> DbResult<Self> {
        Ok(FiscalDevice {
            id: row.id,
            organization_id: row.organization_id,
            name: row.name,
            provider: row.provider,
            credentials: Credentials::new(row.credentials),
            mode: row.mode,
            status: row.status,
            auto_open_shift: row.auto_open_shift,
            auto_close_shift: row.auto_close_shift,
            open_at: parse_time(row.open_at)?,
            close_at: parse_time(row.close_at)?,
            default_cashier: row.default_cashier,
            retired_at: opt_from_millis(row.retired_at),
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        })
    }
}

/// Repository for fiscal device operations.
#[derive(Debug, Clone)]
pub struct DeviceRepository {
    pool: SqlitePool,
}

impl DeviceRepository {
    /// Creates a new DeviceRepository.
    pub fn new(pool: SqlitePool) -> Self {
        DeviceRepository { pool }
    }

    /// Registers a device and returns it.
    pub async fn register(&self, new: NewDevice, now: DateTime<Utc>) -> DbResult<FiscalDevice> {
        let device = FiscalDevice {
            id: Uuid::new_v4().to_string(),
            organization_id: new.organization_id,
            name: new.name,
            provider: new.provider,
            credentials: new.credentials,
            mode: new.mode,
            status: new.status,
            auto_open_shift: new.auto_open_shift,
            auto_close_shift: new.auto_close_shift,
            open_at: new.open_at,
            close_at: new.close_at,
            default_cashier: new.default_cashier,
            retired_at: None,
            created_at: now,
            updated_at: now,
        };

        info!(id = %device.id, org = %device.organization_id, name = %device.name, "Registering fiscal device");

        sqlx::query(
            r#"
            INSERT INTO fiscal_devices (
                id, organization_id, name, provider, credentials, mode, status,
                auto_open_shift, auto_close_shift, open_at, close_at, default_cashier,
                retired_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, ?13, ?13)
            "#,
        )
        .bind(&device.id)
        .bind(&device.organization_id)
        .bind(&device.name)
        .bind(&device.provider)
        .bind(device.credentials.as_bytes())
        .bind(device.mode)
        .bind(device.status)
        .bind(device.auto_open_shift)
        .bind(device.auto_close_shift)
        .bind(format_time(device.open_at))
        .bind(format_time(device.close_at))
        .bind(&device.default_cashier)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(device)
    }

    /// Gets a device by ID.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<FiscalDevice>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM fiscal_devices WHERE id = ?1");
        let row: Option<DeviceRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(FiscalDevice::try_from).transpose()
    }

    /// Gets a device by ID or fails with NotFound.
    pub async fn require(&self, id: &str) -> DbResult<FiscalDevice> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| DbError::not_found("FiscalDevice", id))
    }

    /// All devices of an organization, retired ones included.
    pub async fn list_by_organization(&self, organization_id: &str) -> DbResult<Vec<FiscalDevice>> {
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM fiscal_devices WHERE organization_id = ?1 ORDER BY created_at, id"
        );
        let rows: Vec<DeviceRow> = sqlx::query_as(&sql)
            .bind(organization_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(FiscalDevice::try_from).collect()
    }

    /// Devices whose queues may be drained (ACTIVE and not retired).
    pub async fn list_operational(&self) -> DbResult<Vec<FiscalDevice>> {
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM fiscal_devices \
             WHERE status = 'active' AND retired_at IS NULL ORDER BY created_at, id"
        );
        let rows: Vec<DeviceRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(FiscalDevice::try_from).collect()
    }

    /// Admin-driven status change. Retired devices cannot change status.
    pub async fn set_status(
        &self,
        id: &str,
        status: DeviceStatus,
        now: DateTime<Utc>,
    ) -> DbResult<FiscalDevice> {
        let result = sqlx::query(
            "UPDATE fiscal_devices SET status = ?2, updated_at = ?3 WHERE id = ?1 AND retired_at IS NULL",
        )
        .bind(id)
        .bind(status)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let device = self.require(id).await?;
            return Err(DbError::conflict(
                "FiscalDevice",
                &device.id,
                "device is retired",
            ));
        }

        debug!(id = %id, status = ?status, "Device status changed");
        self.require(id).await
    }

    /// Updates the automatic shift settings.
    pub async fn update_schedule(
        &self,
        id: &str,
        auto_open_shift: bool,
        auto_close_shift: bool,
        open_at: Option<NaiveTime>,
        close_at: Option<NaiveTime>,
        now: DateTime<Utc>,
    ) -> DbResult<FiscalDevice> {
        let result = sqlx::query(
            r#"
            UPDATE fiscal_devices SET
                auto_open_shift = ?2,
                auto_close_shift = ?3,
                open_at = ?4,
                close_at = ?5,
                updated_at = ?6
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(auto_open_shift)
        .bind(auto_close_shift)
        .bind(format_time(open_at))
        .bind(format_time(close_at))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("FiscalDevice", id));
        }
        self.require(id).await
    }

    /// Soft retire. Idempotent: retiring twice keeps the first timestamp.
    pub async fn retire(&self, id: &str, now: DateTime<Utc>) -> DbResult<FiscalDevice> {
        sqlx::query(
            r#"
            UPDATE fiscal_devices SET
                retired_at = COALESCE(retired_at, ?2),
                status = 'inactive',
                updated_at = ?2
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        let device = self.require(id).await?;
        info!(id = %id, "Fiscal device retired");
        Ok(device)
    }

    /// Number of registered devices.
    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fiscal_devices")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
