use crate::xml::{PriceRow, StoreMeta, StoreRow};
use anyhow::Context;
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::collections::HashMap;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio_postgres::NoTls;

/// Persistence surface for crawl results. Kept narrow so the orchestrator
/// and the tests run against the same contract.
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Upsert a retailer by slug. `need_creds: None` preserves whatever
    /// the row already says.
    async fn upsert_retailer(
        &self,
        slug: &str,
        name: &str,
        need_creds: Option<bool>,
    ) -> Result<i32, anyhow::Error>;

    /// Upsert a store by (retailer, external id). Populated fields never
    /// regress to empty.
    async fn upsert_store(
        &self,
        retailer_id: i32,
        external_id: &str,
        name: Option<&str>,
        city: Option<&str>,
        address: Option<&str>,
    ) -> Result<i32, anyhow::Error>;

    /// Upsert a product by barcode with non-empty-preserving metadata.
    #[allow(clippy::too_many_arguments)]
    async fn upsert_product(
        &self,
        barcode: &str,
        name: Option<&str>,
        brand: Option<&str>,
        quantity: Option<f64>,
        unit: Option<&str>,
        is_weighted: bool,
        image_url: Option<&str>,
    ) -> Result<i32, anyhow::Error>;

    /// Append one price observation. Never deduplicated at this layer.
    async fn insert_snapshot(
        &self,
        product_id: i32,
        retailer_id: i32,
        store_id: Option<i32>,
        price: f64,
        is_on_sale: bool,
        timestamp: OffsetDateTime,
    ) -> Result<i64, anyhow::Error>;
}

/// Parse the reported timestamp out of a feed date string
/// (`YYYY-MM-DD HH:MM:SS` prefix); anything else falls back to now.
fn reported_timestamp(date: Option<&str>) -> OffsetDateTime {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    date.and_then(|d| d.get(..19))
        .and_then(|d| PrimitiveDateTime::parse(d, format).ok())
        .map(PrimitiveDateTime::assume_utc)
        .unwrap_or_else(OffsetDateTime::now_utc)
}

/// Persist price rows with the ordered upsert sequence: retailer, store
/// (cached per file), product, snapshot. Row-level failures are logged
/// and skipped; the file keeps going.
pub async fn save_price_rows(
    store: &dyn PriceStore,
    slug: &str,
    retailer_name: &str,
    rows: &[PriceRow],
    meta: &StoreMeta,
) -> Result<usize, anyhow::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let retailer_id = store.upsert_retailer(slug, retailer_name, None).await?;
    let mut store_cache: HashMap<String, i32> = HashMap::new();
    let mut saved = 0usize;

    for row in rows {
        let ext_store_id = row.store_id.as_deref().or(meta.store_id.as_deref());
        let mut db_store_id = None;
        if let Some(ext_id) = ext_store_id {
            db_store_id = match store_cache.get(ext_id) {
                Some(id) => Some(*id),
                None => match store
                    .upsert_store(
                        retailer_id,
                        ext_id,
                        meta.name.as_deref(),
                        meta.city.as_deref(),
                        meta.address.as_deref(),
                    )
                    .await
                {
                    Ok(id) => {
                        store_cache.insert(ext_id.to_string(), id);
                        Some(id)
                    }
                    Err(err) => {
                        log::error!("store upsert failed retailer={slug} ext_id={ext_id}: {err}");
                        None
                    }
                },
            };
        }

        let product_id = match store
            .upsert_product(
                &row.barcode,
                row.name.as_deref(),
                row.brand.as_deref(),
                row.quantity,
                row.unit.as_deref(),
                row.is_weighted,
                row.image_url.as_deref(),
            )
            .await
        {
            Ok(id) => id,
            Err(err) => {
                log::error!("product upsert failed barcode={}: {err}", row.barcode);
                continue;
            }
        };

        match store
            .insert_snapshot(
                product_id,
                retailer_id,
                db_store_id,
                row.price,
                row.is_on_sale,
                reported_timestamp(row.date.as_deref()),
            )
            .await
        {
            Ok(_) => saved += 1,
            Err(err) => log::error!("snapshot insert failed barcode={}: {err}", row.barcode),
        }
    }

    log::info!("db.saved retailer={slug} count={saved}/{}", rows.len());
    Ok(saved)
}

/// Persist store-directory rows: retailer then stores, nothing else.
pub async fn save_store_rows(
    store: &dyn PriceStore,
    slug: &str,
    retailer_name: &str,
    rows: &[StoreRow],
) -> Result<usize, anyhow::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let retailer_id = store.upsert_retailer(slug, retailer_name, None).await?;
    let mut saved = 0usize;
    for row in rows {
        match store
            .upsert_store(
                retailer_id,
                &row.external_id,
                row.name.as_deref(),
                row.city.as_deref(),
                row.address.as_deref(),
            )
            .await
        {
            Ok(_) => saved += 1,
            Err(err) => {
                log::error!(
                    "store upsert failed retailer={slug} ext_id={}: {err}",
                    row.external_id
                );
            }
        }
    }
    Ok(saved)
}

/// Postgres-backed gateway over a small shared pool.
pub struct PostgresPriceStore {
    pool: Pool,
}

impl PostgresPriceStore {
    /// Build the pool from a `DATABASE_URL`-style connection string.
    /// Capped at 5 connections; statements time out after 60s.
    pub fn connect(database_url: &str) -> Result<Self, anyhow::Error> {
        let mut pg_config: tokio_postgres::Config = database_url
            .parse()
            .context("invalid DATABASE_URL")?;
        pg_config.options("-c statement_timeout=60000");
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(5)
            .build()
            .context("unable to build postgres pool")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl PriceStore for PostgresPriceStore {
    async fn upsert_retailer(
        &self,
        slug: &str,
        name: &str,
        need_creds: Option<bool>,
    ) -> Result<i32, anyhow::Error> {
        let client = self.pool.get().await?;
        let row = match need_creds {
            None => {
                client
                    .query_one(
                        r#"INSERT INTO retailers (slug, name, "needCreds", "createdAt", "updatedAt")
                           VALUES ($1, $2, false, NOW(), NOW())
                           ON CONFLICT (slug) DO UPDATE SET
                               name = EXCLUDED.name,
                               "updatedAt" = NOW()
                           RETURNING id"#,
                        &[&slug, &name],
                    )
                    .await?
            }
            Some(need_creds) => {
                client
                    .query_one(
                        r#"INSERT INTO retailers (slug, name, "needCreds", "createdAt", "updatedAt")
                           VALUES ($1, $2, $3, NOW(), NOW())
                           ON CONFLICT (slug) DO UPDATE SET
                               name = EXCLUDED.name,
                               "needCreds" = EXCLUDED."needCreds",
                               "updatedAt" = NOW()
                           RETURNING id"#,
                        &[&slug, &name, &need_creds],
                    )
                    .await?
            }
        };
        Ok(row.try_get("id")?)
    }

    async fn upsert_store(
        &self,
        retailer_id: i32,
        external_id: &str,
        name: Option<&str>,
        city: Option<&str>,
        address: Option<&str>,
    ) -> Result<i32, anyhow::Error> {
        let client = self.pool.get().await?;
        // Placeholder name applies on first sighting only; the update
        // clause coalesces the raw parameter so later sparse rows never
        // regress a known name.
        let row = client
            .query_one(
                r#"INSERT INTO stores ("retailerId", "externalId", name, city, address, "createdAt", "updatedAt")
                   VALUES ($1, $2, COALESCE(NULLIF($3, ''), 'Store ' || $2), $4, $5, NOW(), NOW())
                   ON CONFLICT ("retailerId", "externalId") DO UPDATE SET
                       name = COALESCE(NULLIF($3, ''), stores.name),
                       city = COALESCE(NULLIF($4, ''), stores.city),
                       address = COALESCE(NULLIF($5, ''), stores.address),
                       "updatedAt" = NOW()
                   RETURNING id"#,
                &[&retailer_id, &external_id, &name, &city, &address],
            )
            .await?;
        Ok(row.try_get("id")?)
    }

    async fn upsert_product(
        &self,
        barcode: &str,
        name: Option<&str>,
        brand: Option<&str>,
        quantity: Option<f64>,
        unit: Option<&str>,
        is_weighted: bool,
        image_url: Option<&str>,
    ) -> Result<i32, anyhow::Error> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                r#"INSERT INTO products (barcode, name, brand, quantity, unit, "isWeighted", "imageUrl", "createdAt", "updatedAt")
                   VALUES ($1, COALESCE(NULLIF($2, ''), 'Unknown (' || $1 || ')'), $3, $4, $5, $6, $7, NOW(), NOW())
                   ON CONFLICT (barcode) DO UPDATE SET
                       name = COALESCE(NULLIF($2, ''), products.name),
                       brand = COALESCE(NULLIF($3, ''), products.brand),
                       quantity = COALESCE($4, products.quantity),
                       unit = COALESCE(NULLIF($5, ''), products.unit),
                       "isWeighted" = EXCLUDED."isWeighted",
                       "imageUrl" = COALESCE(NULLIF($7, ''), products."imageUrl"),
                       "updatedAt" = NOW()
                   RETURNING id"#,
                &[
                    &barcode,
                    &name,
                    &brand,
                    &quantity,
                    &unit,
                    &is_weighted,
                    &image_url,
                ],
            )
            .await?;
        Ok(row.try_get("id")?)
    }

    async fn insert_snapshot(
        &self,
        product_id: i32,
        retailer_id: i32,
        store_id: Option<i32>,
        price: f64,
        is_on_sale: bool,
        timestamp: OffsetDateTime,
    ) -> Result<i64, anyhow::Error> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                r#"INSERT INTO price_snapshots
                       ("productId", "retailerId", "storeId", price, "isOnSale", timestamp, "seenAt")
                   VALUES ($1, $2, $3, $4, $5, $6, NOW())
                   RETURNING id"#,
                &[
                    &product_id,
                    &retailer_id,
                    &store_id,
                    &price,
                    &is_on_sale,
                    &timestamp,
                ],
            )
            .await?;
        Ok(row.try_get("id")?)
    }
}
