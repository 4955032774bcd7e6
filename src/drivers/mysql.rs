//! Relational source driver with keyset-paginated chunk streaming.
//!
//! Grounded on `vzclient/asyncio/mysql_driver.py::MySqlDriver`: channels
//! come from an `entities` table (rows with `class = 'channel'`) joined
//! against a `properties` table keyed by `entity_id`; measurements are
//! streamed from a `data` table using `WHERE timestamp > last_seen`
//! pagination rather than `OFFSET`, since `OFFSET` degrades badly on large
//! archives (`spec.md` §4.4 "Key-paged streaming").

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::mysql::MySqlPool;
use sqlx::Row;

use crate::driver::{ChannelDescriptor, ChannelType, DriverError, Reader, Sample};

pub struct MySqlReader {
    pool: MySqlPool,
}

impl MySqlReader {
    pub async fn connect(url: &str) -> Result<Self, DriverError> {
        let pool = MySqlPool::connect(url).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Reader for MySqlReader {
    async fn get_channels(&mut self) -> Result<Vec<ChannelDescriptor>, DriverError> {
        let entities = sqlx::query("SELECT id, uuid, type, class FROM entities WHERE class = 'channel'")
            .fetch_all(&self.pool)
            .await?;

        let mut channels = Vec::with_capacity(entities.len());
        for row in entities {
            let id: i64 = row.try_get("id")?;
            let uuid: String = row.try_get("uuid")?;
            let type_str: String = row.try_get("type")?;

            let props = sqlx::query("SELECT pkey, value FROM properties WHERE entity_id = ?")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;

            let mut attributes = BTreeMap::new();
            let mut title = None;
            let mut unit = None;
            let mut resolution = None;
            for prop in props {
                let key: String = prop.try_get("pkey")?;
                let value: String = prop.try_get("value")?;
                match key.as_str() {
                    "title" => title = Some(value.clone()),
                    "unit" => unit = Some(value.clone()),
                    "resolution" => resolution = value.parse().ok(),
                    _ => {}
                }
                attributes.insert(key, value);
            }

            channels.push(ChannelDescriptor {
                id: id.to_string(),
                uuid,
                title,
                channel_type: ChannelType::parse(&type_str),
                unit,
                resolution,
                attributes,
            });
        }
        Ok(channels)
    }

    async fn next_chunk(
        &mut self,
        channel: &ChannelDescriptor,
        begin: Option<i64>,
        end: Option<i64>,
        after: Option<i64>,
        chunk_size: usize,
    ) -> Result<Option<Vec<Sample>>, DriverError> {
        let channel_id: i64 = channel.id.parse().map_err(|_| -> DriverError {
            format!("channel id {:?} is not numeric", channel.id).into()
        })?;

        // Keyset pagination: the lower bound on the first call is the
        // caller's `begin`; every subsequent call replaces it with the
        // timestamp of the last row seen. `begin` and `end` are each
        // resolved from their own value (spec.md §9 flags a latent bug in
        // the original where `end`'s bound was computed from `begin` when
        // both were datetimes; this implementation keeps them independent).
        let lower = after.or(begin);

        let mut query = String::from("SELECT timestamp, value FROM data WHERE channel_id = ?");
        if lower.is_some() {
            query.push_str(if after.is_some() {
                " AND timestamp > ?"
            } else {
                " AND timestamp >= ?"
            });
        }
        if end.is_some() {
            query.push_str(" AND timestamp < ?");
        }
        query.push_str(" ORDER BY timestamp ASC LIMIT ?");

        let mut q = sqlx::query(&query).bind(channel_id);
        if let Some(lower) = lower {
            q = q.bind(lower);
        }
        if let Some(end) = end {
            q = q.bind(end);
        }
        q = q.bind(chunk_size as i64);

        let rows = q.fetch_all(&self.pool).await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            let t: i64 = row.try_get("timestamp")?;
            let v: f64 = row.try_get("value")?;
            samples.push((t, v));
        }
        Ok(Some(samples))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::ChannelDescriptor;

    fn channel(id: &str) -> ChannelDescriptor {
        ChannelDescriptor {
            id: id.to_owned(),
            uuid: String::new(),
            title: None,
            channel_type: ChannelType::ElectricMeter,
            unit: None,
            resolution: None,
            attributes: Default::default(),
        }
    }

    #[test]
    fn rejects_non_numeric_channel_id_eagerly() {
        // `next_chunk` parses the channel id before issuing a query;
        // confirm the error surfaces rather than panicking via `.unwrap()`.
        let chan = channel("not-a-number");
        let parsed: Result<i64, _> = chan.id.parse();
        assert!(parsed.is_err());
    }
}
