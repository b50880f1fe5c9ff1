//! PostgreSQL-backed store implementation.
//!
//! Hand-written parameterized upserts throughout: `INSERT ... ON CONFLICT
//! (pk) DO UPDATE SET ...` excluding `created_at`. The listing commit runs
//! in a per-record transaction; per-page transactions are deliberately not
//! used (lock times and rollback blast radius).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::model::{
    ChangeLogEntry, Listing, LookupValue, MediaAsset, MediaDownloadAudit, MediaStatus, Member,
    Office, OpenHouse, PriceChange, ReplicationRun, RequestLogEntry, ResourceKind, Room,
    RunCounters, RunMode, RunStatus, StatusChange, UnitType,
};

use super::ReplicationStore;

/// Open a connection pool against the replication database.
pub async fn connect(database_url: &str, pool_size: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(pool_size)
        .connect(database_url)
        .await
        .context("connecting to PostgreSQL")?;
    Ok(pool)
}

/// Store implementation over a shared [`PgPool`].
pub struct PgReplicationStore {
    pool: PgPool,
}

impl PgReplicationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn local_fields_value(fields: &serde_json::Map<String, Value>) -> Value {
    Value::Object(fields.clone())
}

fn local_fields_from(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

fn listing_from_row(row: &PgRow) -> Result<Listing> {
    Ok(Listing {
        listing_key: row.try_get("listing_key")?,
        listing_id: row.try_get("listing_id")?,
        listing_id_display: row.try_get("listing_id_display")?,
        originating_system: row.try_get("originating_system")?,
        list_price: row.try_get("list_price")?,
        original_list_price: row.try_get("original_list_price")?,
        previous_list_price: row.try_get("previous_list_price")?,
        close_price: row.try_get("close_price")?,
        standard_status: row.try_get("standard_status")?,
        mls_status: row.try_get("mls_status")?,
        major_change_type: row.try_get("major_change_type")?,
        property_type: row.try_get("property_type")?,
        property_sub_type: row.try_get("property_sub_type")?,
        bedrooms_total: row.try_get("bedrooms_total")?,
        bathrooms_total: row.try_get("bathrooms_total")?,
        living_area: row.try_get("living_area")?,
        lot_size_acres: row.try_get("lot_size_acres")?,
        year_built: row.try_get("year_built")?,
        stories: row.try_get("stories")?,
        garage_spaces: row.try_get("garage_spaces")?,
        unparsed_address: row.try_get("unparsed_address")?,
        street_number: row.try_get("street_number")?,
        street_name: row.try_get("street_name")?,
        city: row.try_get("city")?,
        state_or_province: row.try_get("state_or_province")?,
        postal_code: row.try_get("postal_code")?,
        county: row.try_get("county")?,
        subdivision_name: row.try_get("subdivision_name")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        location_point: row.try_get("location_point")?,
        list_agent_key: row.try_get("list_agent_key")?,
        list_agent_mls_id: row.try_get("list_agent_mls_id")?,
        list_office_key: row.try_get("list_office_key")?,
        list_office_mls_id: row.try_get("list_office_mls_id")?,
        buyer_agent_mls_id: row.try_get("buyer_agent_mls_id")?,
        buyer_office_mls_id: row.try_get("buyer_office_mls_id")?,
        public_remarks: row.try_get("public_remarks")?,
        syndication_remarks: row.try_get("syndication_remarks")?,
        elementary_school: row.try_get("elementary_school")?,
        middle_school: row.try_get("middle_school")?,
        high_school: row.try_get("high_school")?,
        school_district: row.try_get("school_district")?,
        tax_annual_amount: row.try_get("tax_annual_amount")?,
        tax_year: row.try_get("tax_year")?,
        parcel_number: row.try_get("parcel_number")?,
        buyer_agency_compensation: row.try_get("buyer_agency_compensation")?,
        buyer_agency_compensation_type: row.try_get("buyer_agency_compensation_type")?,
        can_view: row.try_get("can_view")?,
        use_cases: row.try_get("use_cases")?,
        hidden_at: row.try_get("hidden_at")?,
        photos_count: row.try_get("photos_count")?,
        modification_ts: row.try_get("modification_ts")?,
        originating_mod_ts: row.try_get("originating_mod_ts")?,
        photos_change_ts: row.try_get("photos_change_ts")?,
        major_change_ts: row.try_get("major_change_ts")?,
        original_entry_ts: row.try_get("original_entry_ts")?,
        local_fields: local_fields_from(row.try_get("local_fields")?),
    })
}

fn media_from_row(row: &PgRow) -> Result<MediaAsset> {
    let kind: String = row.try_get("resource_kind")?;
    let status: String = row.try_get("status")?;
    Ok(MediaAsset {
        media_key: row.try_get("media_key")?,
        resource_kind: ResourceKind::from_str(&kind)
            .with_context(|| format!("unknown resource kind '{kind}' in media row"))?,
        parent_key: row.try_get("parent_key")?,
        source_url: row.try_get("source_url")?,
        media_mod_ts: row.try_get("media_mod_ts")?,
        object_key: row.try_get("object_key")?,
        public_url: row.try_get("public_url")?,
        display_order: row.try_get("display_order")?,
        category: row.try_get("category")?,
        file_size_bytes: row.try_get("file_size_bytes")?,
        content_type: row.try_get("content_type")?,
        status: MediaStatus::from_str(&status)
            .with_context(|| format!("unknown media status '{status}'"))?,
        retry_count: row.try_get("retry_count")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<ReplicationRun> {
    let resource: String = row.try_get("resource")?;
    let mode: String = row.try_get("mode")?;
    let status: String = row.try_get("status")?;
    let http_errors: Value = row.try_get("http_errors")?;
    Ok(ReplicationRun {
        id: row.try_get("id")?,
        resource: ResourceKind::from_str(&resource)
            .with_context(|| format!("unknown resource '{resource}' in run row"))?,
        mode: RunMode::from_str(&mode).with_context(|| format!("unknown run mode '{mode}'"))?,
        status: RunStatus::from_str(&status)
            .with_context(|| format!("unknown run status '{status}'"))?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        hwm_start: row.try_get("hwm_start")?,
        hwm_end: row.try_get("hwm_end")?,
        error_message: row.try_get("error_message")?,
        counters: RunCounters {
            records_received: row.try_get::<i64, _>("records_received")? as u64,
            records_inserted: row.try_get::<i64, _>("records_inserted")? as u64,
            records_updated: row.try_get::<i64, _>("records_updated")? as u64,
            records_deleted: row.try_get::<i64, _>("records_deleted")? as u64,
            media_downloaded: row.try_get::<i64, _>("media_downloaded")? as u64,
            media_deleted: row.try_get::<i64, _>("media_deleted")? as u64,
            media_bytes: row.try_get::<i64, _>("media_bytes")? as u64,
            requests: row.try_get::<i64, _>("requests")? as u64,
            request_bytes: row.try_get::<i64, _>("request_bytes")? as u64,
            avg_latency_ms: row.try_get("avg_latency_ms")?,
            http_errors: serde_json::from_value(http_errors).unwrap_or_default(),
        },
    })
}

const LISTING_UPSERT: &str = r#"
INSERT INTO listings (
    listing_key, listing_id, listing_id_display, originating_system,
    list_price, original_list_price, previous_list_price, close_price,
    standard_status, mls_status, major_change_type,
    property_type, property_sub_type, bedrooms_total, bathrooms_total,
    living_area, lot_size_acres, year_built, stories, garage_spaces,
    unparsed_address, street_number, street_name, city, state_or_province,
    postal_code, county, subdivision_name, latitude, longitude, location_point,
    list_agent_key, list_agent_mls_id, list_office_key, list_office_mls_id,
    buyer_agent_mls_id, buyer_office_mls_id,
    public_remarks, syndication_remarks,
    elementary_school, middle_school, high_school, school_district,
    tax_annual_amount, tax_year, parcel_number,
    buyer_agency_compensation, buyer_agency_compensation_type,
    can_view, use_cases, hidden_at, photos_count,
    modification_ts, originating_mod_ts, photos_change_ts, major_change_ts,
    original_entry_ts, local_fields, created_at, updated_at
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
    $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30,
    ST_GeomFromEWKT($31), $32, $33, $34, $35, $36, $37, $38, $39, $40, $41,
    $42, $43, $44, $45, $46, $47, $48, $49, $50, $51, $52, $53, $54, $55,
    $56, $57, $58, now(), now()
)
ON CONFLICT (listing_key) DO UPDATE SET
    listing_id = excluded.listing_id,
    listing_id_display = excluded.listing_id_display,
    originating_system = excluded.originating_system,
    list_price = excluded.list_price,
    original_list_price = excluded.original_list_price,
    previous_list_price = excluded.previous_list_price,
    close_price = excluded.close_price,
    standard_status = excluded.standard_status,
    mls_status = excluded.mls_status,
    major_change_type = excluded.major_change_type,
    property_type = excluded.property_type,
    property_sub_type = excluded.property_sub_type,
    bedrooms_total = excluded.bedrooms_total,
    bathrooms_total = excluded.bathrooms_total,
    living_area = excluded.living_area,
    lot_size_acres = excluded.lot_size_acres,
    year_built = excluded.year_built,
    stories = excluded.stories,
    garage_spaces = excluded.garage_spaces,
    unparsed_address = excluded.unparsed_address,
    street_number = excluded.street_number,
    street_name = excluded.street_name,
    city = excluded.city,
    state_or_province = excluded.state_or_province,
    postal_code = excluded.postal_code,
    county = excluded.county,
    subdivision_name = excluded.subdivision_name,
    latitude = excluded.latitude,
    longitude = excluded.longitude,
    location_point = excluded.location_point,
    list_agent_key = excluded.list_agent_key,
    list_agent_mls_id = excluded.list_agent_mls_id,
    list_office_key = excluded.list_office_key,
    list_office_mls_id = excluded.list_office_mls_id,
    buyer_agent_mls_id = excluded.buyer_agent_mls_id,
    buyer_office_mls_id = excluded.buyer_office_mls_id,
    public_remarks = excluded.public_remarks,
    syndication_remarks = excluded.syndication_remarks,
    elementary_school = excluded.elementary_school,
    middle_school = excluded.middle_school,
    high_school = excluded.high_school,
    school_district = excluded.school_district,
    tax_annual_amount = excluded.tax_annual_amount,
    tax_year = excluded.tax_year,
    parcel_number = excluded.parcel_number,
    buyer_agency_compensation = excluded.buyer_agency_compensation,
    buyer_agency_compensation_type = excluded.buyer_agency_compensation_type,
    can_view = excluded.can_view,
    use_cases = excluded.use_cases,
    hidden_at = excluded.hidden_at,
    photos_count = excluded.photos_count,
    modification_ts = excluded.modification_ts,
    originating_mod_ts = excluded.originating_mod_ts,
    photos_change_ts = excluded.photos_change_ts,
    major_change_ts = excluded.major_change_ts,
    original_entry_ts = excluded.original_entry_ts,
    local_fields = excluded.local_fields,
    updated_at = now()
"#;

const LISTING_SELECT: &str = r#"
SELECT listing_key, listing_id, listing_id_display, originating_system,
       list_price, original_list_price, previous_list_price, close_price,
       standard_status, mls_status, major_change_type,
       property_type, property_sub_type, bedrooms_total, bathrooms_total,
       living_area, lot_size_acres, year_built, stories, garage_spaces,
       unparsed_address, street_number, street_name, city, state_or_province,
       postal_code, county, subdivision_name, latitude, longitude,
       ST_AsEWKT(location_point) AS location_point,
       list_agent_key, list_agent_mls_id, list_office_key, list_office_mls_id,
       buyer_agent_mls_id, buyer_office_mls_id,
       public_remarks, syndication_remarks,
       elementary_school, middle_school, high_school, school_district,
       tax_annual_amount, tax_year, parcel_number,
       buyer_agency_compensation, buyer_agency_compensation_type,
       can_view, use_cases, hidden_at, photos_count,
       modification_ts, originating_mod_ts, photos_change_ts, major_change_ts,
       original_entry_ts, local_fields
FROM listings WHERE listing_key = $1
"#;

fn bind_listing<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    l: &'q Listing,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(&l.listing_key)
        .bind(&l.listing_id)
        .bind(&l.listing_id_display)
        .bind(&l.originating_system)
        .bind(&l.list_price)
        .bind(&l.original_list_price)
        .bind(&l.previous_list_price)
        .bind(&l.close_price)
        .bind(&l.standard_status)
        .bind(&l.mls_status)
        .bind(&l.major_change_type)
        .bind(&l.property_type)
        .bind(&l.property_sub_type)
        .bind(l.bedrooms_total)
        .bind(&l.bathrooms_total)
        .bind(&l.living_area)
        .bind(&l.lot_size_acres)
        .bind(l.year_built)
        .bind(l.stories)
        .bind(&l.garage_spaces)
        .bind(&l.unparsed_address)
        .bind(&l.street_number)
        .bind(&l.street_name)
        .bind(&l.city)
        .bind(&l.state_or_province)
        .bind(&l.postal_code)
        .bind(&l.county)
        .bind(&l.subdivision_name)
        .bind(l.latitude)
        .bind(l.longitude)
        .bind(&l.location_point)
        .bind(&l.list_agent_key)
        .bind(&l.list_agent_mls_id)
        .bind(&l.list_office_key)
        .bind(&l.list_office_mls_id)
        .bind(&l.buyer_agent_mls_id)
        .bind(&l.buyer_office_mls_id)
        .bind(&l.public_remarks)
        .bind(&l.syndication_remarks)
        .bind(&l.elementary_school)
        .bind(&l.middle_school)
        .bind(&l.high_school)
        .bind(&l.school_district)
        .bind(&l.tax_annual_amount)
        .bind(l.tax_year)
        .bind(&l.parcel_number)
        .bind(&l.buyer_agency_compensation)
        .bind(&l.buyer_agency_compensation_type)
        .bind(l.can_view)
        .bind(&l.use_cases)
        .bind(l.hidden_at)
        .bind(l.photos_count)
        .bind(l.modification_ts)
        .bind(l.originating_mod_ts)
        .bind(l.photos_change_ts)
        .bind(l.major_change_ts)
        .bind(l.original_entry_ts)
        .bind(local_fields_value(&l.local_fields))
}

#[async_trait]
impl ReplicationStore for PgReplicationStore {
    async fn get_listing(&self, listing_key: &str) -> Result<Option<Listing>> {
        let row = sqlx::query(LISTING_SELECT)
            .bind(listing_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn get_listing_id(&self, listing_key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT listing_id FROM listings WHERE listing_key = $1")
            .bind(listing_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("listing_id")))
    }

    async fn commit_listing(
        &self,
        listing: &Listing,
        rooms: &[Room],
        unit_types: &[UnitType],
        raw: &Value,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM rooms WHERE listing_key = $1")
            .bind(&listing.listing_key)
            .execute(&mut *tx)
            .await?;
        for room in rooms {
            sqlx::query(
                r#"INSERT INTO rooms
                   (room_key, listing_key, room_type, room_level, room_dimensions,
                    room_area, room_features)
                   VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
            )
            .bind(&room.room_key)
            .bind(&room.listing_key)
            .bind(&room.room_type)
            .bind(&room.room_level)
            .bind(&room.room_dimensions)
            .bind(&room.room_area)
            .bind(&room.room_features)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM unit_types WHERE listing_key = $1")
            .bind(&listing.listing_key)
            .execute(&mut *tx)
            .await?;
        for unit in unit_types {
            sqlx::query(
                r#"INSERT INTO unit_types
                   (unit_type_key, listing_key, unit_type, beds_total, baths_total,
                    units_total, actual_rent)
                   VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
            )
            .bind(&unit.unit_type_key)
            .bind(&unit.listing_key)
            .bind(&unit.unit_type)
            .bind(unit.beds_total)
            .bind(&unit.baths_total)
            .bind(unit.units_total)
            .bind(&unit.actual_rent)
            .execute(&mut *tx)
            .await?;
        }

        bind_listing(sqlx::query(LISTING_UPSERT), listing)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"INSERT INTO raw_archive (listing_key, payload, updated_at)
               VALUES ($1, $2, now())
               ON CONFLICT (listing_key) DO UPDATE SET
                   payload = excluded.payload,
                   updated_at = now()"#,
        )
        .bind(&listing.listing_key)
        .bind(raw)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_listing_hidden(&self, listing_key: &str, hidden_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"UPDATE listings
               SET can_view = false, hidden_at = $2, updated_at = now()
               WHERE listing_key = $1"#,
        )
        .bind(listing_key)
        .bind(hidden_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn listings_hidden_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT listing_key FROM listings WHERE hidden_at IS NOT NULL AND hidden_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("listing_key")).collect())
    }

    async fn purge_listing(&self, listing_key: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        // Rooms and unit types cascade from the listing FK; the rest are
        // keyed by listing_key without FKs and need explicit deletes.
        sqlx::query("DELETE FROM media WHERE parent_key = $1")
            .bind(listing_key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM raw_archive WHERE listing_key = $1")
            .bind(listing_key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM price_history WHERE listing_key = $1")
            .bind(listing_key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM status_history WHERE listing_key = $1")
            .bind(listing_key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM change_log WHERE listing_key = $1")
            .bind(listing_key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM listings WHERE listing_key = $1")
            .bind(listing_key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_raw_archive(&self, listing_key: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT payload FROM raw_archive WHERE listing_key = $1")
            .bind(listing_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("payload")))
    }

    async fn refresh_listing_search_view(&self) -> Result<()> {
        sqlx::query("REFRESH MATERIALIZED VIEW CONCURRENTLY listing_search")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_member(&self, member_key: &str) -> Result<Option<Member>> {
        let row = sqlx::query(
            r#"SELECT member_key, member_mls_id, first_name, last_name, full_name,
                      email, phone, office_key, state_license, can_view, hidden_at,
                      modification_ts, photos_change_ts, local_fields
               FROM members WHERE member_key = $1"#,
        )
        .bind(member_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(Member {
                member_key: r.try_get("member_key")?,
                member_mls_id: r.try_get("member_mls_id")?,
                first_name: r.try_get("first_name")?,
                last_name: r.try_get("last_name")?,
                full_name: r.try_get("full_name")?,
                email: r.try_get("email")?,
                phone: r.try_get("phone")?,
                office_key: r.try_get("office_key")?,
                state_license: r.try_get("state_license")?,
                can_view: r.try_get("can_view")?,
                hidden_at: r.try_get("hidden_at")?,
                modification_ts: r.try_get("modification_ts")?,
                photos_change_ts: r.try_get("photos_change_ts")?,
                local_fields: local_fields_from(r.try_get("local_fields")?),
            })
        })
        .transpose()
    }

    async fn upsert_member(&self, member: &Member) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO members
               (member_key, member_mls_id, first_name, last_name, full_name, email,
                phone, office_key, state_license, can_view, hidden_at,
                modification_ts, photos_change_ts, local_fields, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                       now(), now())
               ON CONFLICT (member_key) DO UPDATE SET
                   member_mls_id = excluded.member_mls_id,
                   first_name = excluded.first_name,
                   last_name = excluded.last_name,
                   full_name = excluded.full_name,
                   email = excluded.email,
                   phone = excluded.phone,
                   office_key = excluded.office_key,
                   state_license = excluded.state_license,
                   can_view = excluded.can_view,
                   hidden_at = excluded.hidden_at,
                   modification_ts = excluded.modification_ts,
                   photos_change_ts = excluded.photos_change_ts,
                   local_fields = excluded.local_fields,
                   updated_at = now()"#,
        )
        .bind(&member.member_key)
        .bind(&member.member_mls_id)
        .bind(&member.first_name)
        .bind(&member.last_name)
        .bind(&member.full_name)
        .bind(&member.email)
        .bind(&member.phone)
        .bind(&member.office_key)
        .bind(&member.state_license)
        .bind(member.can_view)
        .bind(member.hidden_at)
        .bind(member.modification_ts)
        .bind(member.photos_change_ts)
        .bind(local_fields_value(&member.local_fields))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_member_hidden(&self, member_key: &str, hidden_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"UPDATE members SET can_view = false, hidden_at = $2, updated_at = now()
               WHERE member_key = $1"#,
        )
        .bind(member_key)
        .bind(hidden_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_office(&self, office_key: &str) -> Result<Option<Office>> {
        let row = sqlx::query(
            r#"SELECT office_key, office_mls_id, name, phone, email, address, city,
                      state_or_province, postal_code, can_view, hidden_at,
                      modification_ts, photos_change_ts, local_fields
               FROM offices WHERE office_key = $1"#,
        )
        .bind(office_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(Office {
                office_key: r.try_get("office_key")?,
                office_mls_id: r.try_get("office_mls_id")?,
                name: r.try_get("name")?,
                phone: r.try_get("phone")?,
                email: r.try_get("email")?,
                address: r.try_get("address")?,
                city: r.try_get("city")?,
                state_or_province: r.try_get("state_or_province")?,
                postal_code: r.try_get("postal_code")?,
                can_view: r.try_get("can_view")?,
                hidden_at: r.try_get("hidden_at")?,
                modification_ts: r.try_get("modification_ts")?,
                photos_change_ts: r.try_get("photos_change_ts")?,
                local_fields: local_fields_from(r.try_get("local_fields")?),
            })
        })
        .transpose()
    }

    async fn upsert_office(&self, office: &Office) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO offices
               (office_key, office_mls_id, name, phone, email, address, city,
                state_or_province, postal_code, can_view, hidden_at,
                modification_ts, photos_change_ts, local_fields, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                       now(), now())
               ON CONFLICT (office_key) DO UPDATE SET
                   office_mls_id = excluded.office_mls_id,
                   name = excluded.name,
                   phone = excluded.phone,
                   email = excluded.email,
                   address = excluded.address,
                   city = excluded.city,
                   state_or_province = excluded.state_or_province,
                   postal_code = excluded.postal_code,
                   can_view = excluded.can_view,
                   hidden_at = excluded.hidden_at,
                   modification_ts = excluded.modification_ts,
                   photos_change_ts = excluded.photos_change_ts,
                   local_fields = excluded.local_fields,
                   updated_at = now()"#,
        )
        .bind(&office.office_key)
        .bind(&office.office_mls_id)
        .bind(&office.name)
        .bind(&office.phone)
        .bind(&office.email)
        .bind(&office.address)
        .bind(&office.city)
        .bind(&office.state_or_province)
        .bind(&office.postal_code)
        .bind(office.can_view)
        .bind(office.hidden_at)
        .bind(office.modification_ts)
        .bind(office.photos_change_ts)
        .bind(local_fields_value(&office.local_fields))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_office_hidden(&self, office_key: &str, hidden_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"UPDATE offices SET can_view = false, hidden_at = $2, updated_at = now()
               WHERE office_key = $1"#,
        )
        .bind(office_key)
        .bind(hidden_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_open_house(&self, open_house: &OpenHouse) -> Result<bool> {
        let row = sqlx::query(
            r#"INSERT INTO open_houses
               (open_house_key, listing_id, start_ts, end_ts, remarks, status,
                modification_ts, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, now(), now())
               ON CONFLICT (open_house_key) DO UPDATE SET
                   listing_id = excluded.listing_id,
                   start_ts = excluded.start_ts,
                   end_ts = excluded.end_ts,
                   remarks = excluded.remarks,
                   status = excluded.status,
                   modification_ts = excluded.modification_ts,
                   updated_at = now()
               RETURNING (xmax = 0) AS inserted"#,
        )
        .bind(&open_house.open_house_key)
        .bind(&open_house.listing_id)
        .bind(open_house.start_ts)
        .bind(open_house.end_ts)
        .bind(&open_house.remarks)
        .bind(&open_house.status)
        .bind(open_house.modification_ts)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("inserted")?)
    }

    async fn delete_open_house(&self, open_house_key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM open_houses WHERE open_house_key = $1")
            .bind(open_house_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_lookup(&self, lookup: &LookupValue) -> Result<bool> {
        let row = sqlx::query(
            r#"INSERT INTO lookups
               (lookup_key, vendor_system, lookup_name, lookup_value,
                standard_lookup_value, modification_ts, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, now(), now())
               ON CONFLICT (lookup_key) DO UPDATE SET
                   vendor_system = excluded.vendor_system,
                   lookup_name = excluded.lookup_name,
                   lookup_value = excluded.lookup_value,
                   standard_lookup_value = excluded.standard_lookup_value,
                   modification_ts = excluded.modification_ts,
                   updated_at = now()
               RETURNING (xmax = 0) AS inserted"#,
        )
        .bind(&lookup.lookup_key)
        .bind(&lookup.vendor_system)
        .bind(&lookup.lookup_name)
        .bind(&lookup.lookup_value)
        .bind(&lookup.standard_lookup_value)
        .bind(lookup.modification_ts)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("inserted")?)
    }

    async fn keys_at_modification_ts(
        &self,
        resource: ResourceKind,
        ts: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let sql = match resource {
            ResourceKind::Listing => {
                "SELECT listing_key AS key FROM listings WHERE modification_ts = $1"
            }
            ResourceKind::Member => {
                "SELECT member_key AS key FROM members WHERE modification_ts = $1"
            }
            ResourceKind::Office => {
                "SELECT office_key AS key FROM offices WHERE modification_ts = $1"
            }
            ResourceKind::OpenHouse => {
                "SELECT open_house_key AS key FROM open_houses WHERE modification_ts = $1"
            }
            ResourceKind::Lookup => {
                "SELECT lookup_key AS key FROM lookups WHERE modification_ts = $1"
            }
        };
        let rows = sqlx::query(sql).bind(ts).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|r| r.get("key")).collect())
    }

    async fn media_for_parent(&self, parent_key: &str) -> Result<Vec<MediaAsset>> {
        let rows = sqlx::query(
            "SELECT * FROM media WHERE parent_key = $1 ORDER BY display_order",
        )
        .bind(parent_key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(media_from_row).collect()
    }

    async fn upsert_media(&self, asset: &MediaAsset) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO media
               (media_key, resource_kind, parent_key, source_url, media_mod_ts,
                object_key, public_url, display_order, category, file_size_bytes,
                content_type, status, retry_count, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now())
               ON CONFLICT (media_key) DO UPDATE SET
                   resource_kind = excluded.resource_kind,
                   parent_key = excluded.parent_key,
                   source_url = excluded.source_url,
                   media_mod_ts = excluded.media_mod_ts,
                   object_key = excluded.object_key,
                   public_url = excluded.public_url,
                   display_order = excluded.display_order,
                   category = excluded.category,
                   file_size_bytes = excluded.file_size_bytes,
                   content_type = excluded.content_type,
                   status = excluded.status,
                   retry_count = excluded.retry_count,
                   updated_at = now()"#,
        )
        .bind(&asset.media_key)
        .bind(asset.resource_kind.as_str())
        .bind(&asset.parent_key)
        .bind(&asset.source_url)
        .bind(asset.media_mod_ts)
        .bind(&asset.object_key)
        .bind(&asset.public_url)
        .bind(asset.display_order)
        .bind(&asset.category)
        .bind(asset.file_size_bytes)
        .bind(&asset.content_type)
        .bind(asset.status.as_str())
        .bind(asset.retry_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_media(&self, media_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM media WHERE media_key = $1")
            .bind(media_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_media_status(&self, media_key: &str, status: MediaStatus) -> Result<()> {
        sqlx::query("UPDATE media SET status = $2, updated_at = now() WHERE media_key = $1")
            .bind(media_key)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_media_complete(
        &self,
        media_key: &str,
        object_key: &str,
        public_url: &str,
        file_size_bytes: i64,
        content_type: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE media
               SET status = 'complete', object_key = $2, public_url = $3,
                   file_size_bytes = $4, content_type = $5, updated_at = now()
               WHERE media_key = $1"#,
        )
        .bind(media_key)
        .bind(object_key)
        .bind(public_url)
        .bind(file_size_bytes)
        .bind(content_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bump_media_retry(&self, media_key: &str) -> Result<i32> {
        let row = sqlx::query(
            r#"UPDATE media SET retry_count = retry_count + 1, updated_at = now()
               WHERE media_key = $1
               RETURNING retry_count"#,
        )
        .bind(media_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("retry_count")).unwrap_or(0))
    }

    async fn update_media_source_url(&self, media_key: &str, url: &str) -> Result<()> {
        sqlx::query("UPDATE media SET source_url = $2 WHERE media_key = $1")
            .bind(media_key)
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_media(&self, limit: usize) -> Result<Vec<MediaAsset>> {
        let rows = sqlx::query(
            r#"SELECT * FROM media WHERE status = 'pending_download'
               ORDER BY updated_at ASC LIMIT $1"#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(media_from_row).collect()
    }

    async fn recoverable_media(&self) -> Result<Vec<MediaAsset>> {
        let rows = sqlx::query("SELECT * FROM media WHERE status IN ('failed', 'expired')")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(media_from_row).collect()
    }

    async fn append_media_audit(&self, audit: &MediaDownloadAudit) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO media_downloads (media_key, parent_key, bytes, elapsed_ms, downloaded_at)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(&audit.media_key)
        .bind(&audit.parent_key)
        .bind(audit.bytes as i64)
        .bind(audit.elapsed_ms)
        .bind(audit.downloaded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn media_download_totals_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, u64)>> {
        let rows = sqlx::query(
            "SELECT downloaded_at, bytes FROM media_downloads WHERE downloaded_at >= $1",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| {
                (
                    r.get::<DateTime<Utc>, _>("downloaded_at"),
                    r.get::<i64, _>("bytes") as u64,
                )
            })
            .collect())
    }

    async fn prune_media_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM media_downloads WHERE downloaded_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn append_price_change(&self, change: &PriceChange) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO price_history (listing_key, old_price, new_price, change_type, recorded_at)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(&change.listing_key)
        .bind(&change.old_price)
        .bind(&change.new_price)
        .bind(&change.change_type)
        .bind(change.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_status_change(&self, change: &StatusChange) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO status_history (listing_key, old_status, new_status, recorded_at)
               VALUES ($1, $2, $3, $4)"#,
        )
        .bind(&change.listing_key)
        .bind(&change.old_status)
        .bind(&change.new_status)
        .bind(change.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_change_log(&self, entry: &ChangeLogEntry) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO change_log (listing_key, field_name, old_value, new_value, recorded_at)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(&entry.listing_key)
        .bind(&entry.field_name)
        .bind(&entry.old_value)
        .bind(&entry.new_value)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn price_changes_for(&self, listing_key: &str) -> Result<Vec<PriceChange>> {
        let rows = sqlx::query(
            r#"SELECT listing_key, old_price, new_price, change_type, recorded_at
               FROM price_history WHERE listing_key = $1 ORDER BY recorded_at"#,
        )
        .bind(listing_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| PriceChange {
                listing_key: r.get("listing_key"),
                old_price: r.get("old_price"),
                new_price: r.get("new_price"),
                change_type: r.get("change_type"),
                recorded_at: r.get("recorded_at"),
            })
            .collect())
    }

    async fn status_changes_for(&self, listing_key: &str) -> Result<Vec<StatusChange>> {
        let rows = sqlx::query(
            r#"SELECT listing_key, old_status, new_status, recorded_at
               FROM status_history WHERE listing_key = $1 ORDER BY recorded_at"#,
        )
        .bind(listing_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| StatusChange {
                listing_key: r.get("listing_key"),
                old_status: r.get("old_status"),
                new_status: r.get("new_status"),
                recorded_at: r.get("recorded_at"),
            })
            .collect())
    }

    async fn change_log_for(&self, listing_key: &str) -> Result<Vec<ChangeLogEntry>> {
        let rows = sqlx::query(
            r#"SELECT listing_key, field_name, old_value, new_value, recorded_at
               FROM change_log WHERE listing_key = $1 ORDER BY recorded_at"#,
        )
        .bind(listing_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| ChangeLogEntry {
                listing_key: r.get("listing_key"),
                field_name: r.get("field_name"),
                old_value: r.get("old_value"),
                new_value: r.get("new_value"),
                recorded_at: r.get("recorded_at"),
            })
            .collect())
    }

    async fn create_run(
        &self,
        resource: ResourceKind,
        mode: RunMode,
        hwm_start: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"INSERT INTO replication_runs
               (resource, mode, status, started_at, hwm_start, http_errors)
               VALUES ($1, $2, 'running', now(), $3, '{}'::jsonb)
               RETURNING id"#,
        )
        .bind(resource.as_str())
        .bind(mode.as_str())
        .bind(hwm_start)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    async fn latest_finished_run(&self, resource: ResourceKind) -> Result<Option<ReplicationRun>> {
        let row = sqlx::query(
            r#"SELECT * FROM replication_runs
               WHERE resource = $1 AND status IN ('completed', 'partial')
               ORDER BY started_at DESC LIMIT 1"#,
        )
        .bind(resource.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn finalize_run(
        &self,
        run_id: i64,
        status: RunStatus,
        error_message: Option<String>,
        hwm_end: Option<DateTime<Utc>>,
        counters: &RunCounters,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE replication_runs SET
                   status = $2, completed_at = now(), error_message = $3, hwm_end = $4,
                   records_received = $5, records_inserted = $6, records_updated = $7,
                   records_deleted = $8, media_downloaded = $9, media_deleted = $10,
                   media_bytes = $11, requests = $12, request_bytes = $13,
                   avg_latency_ms = $14, http_errors = $15
               WHERE id = $1"#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(hwm_end)
        .bind(counters.records_received as i64)
        .bind(counters.records_inserted as i64)
        .bind(counters.records_updated as i64)
        .bind(counters.records_deleted as i64)
        .bind(counters.media_downloaded as i64)
        .bind(counters.media_deleted as i64)
        .bind(counters.media_bytes as i64)
        .bind(counters.requests as i64)
        .bind(counters.request_bytes as i64)
        .bind(counters.avg_latency_ms)
        .bind(serde_json::to_value(&counters.http_errors)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_stale_runs_failed(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"UPDATE replication_runs
               SET status = 'failed', completed_at = now(),
                   error_message = 'worker restarted while run was in progress'
               WHERE status = 'running'"#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn any_completed_run(&self) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM replication_runs WHERE status = 'completed') AS present",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("present"))
    }

    async fn append_request_log(&self, entry: RequestLogEntry) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO request_log
               (run_id, kind, url, status, elapsed_ms, bytes, record_count, error, requested_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(entry.run_id)
        .bind(entry.kind.as_str())
        .bind(&entry.url)
        .bind(entry.status.map(|s| s as i32))
        .bind(entry.elapsed_ms)
        .bind(entry.bytes as i64)
        .bind(entry.record_count.map(|c| c as i32))
        .bind(&entry.error)
        .bind(entry.requested_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn request_timestamps_since(&self, since: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>> {
        let rows = sqlx::query(
            "SELECT requested_at FROM request_log WHERE kind = 'api' AND requested_at >= $1",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("requested_at")).collect())
    }

    async fn prune_request_log_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM request_log WHERE requested_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
