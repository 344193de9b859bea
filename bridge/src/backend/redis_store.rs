//! Redis implementation of the backend traits.
//!
//! Stream encoding: `XREVRANGE key + - COUNT 1` reads the latest entry and
//! `XADD key * ...` appends a version. Document encoding: `JSON.GET key`
//! reads, `JSON.SET key $ doc` writes, and `INCR <key>:version` numbers the
//! versions. Commits run under `WATCH` + `MULTI/EXEC`; an aborted EXEC means
//! another writer got in first and the read-decide-write cycle is retried.

use log::{debug, warn};
use redis::{Client, Connection, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, Value};
use rule_engine::ObservedQuery;
use std::collections::{BTreeMap, HashMap};

use super::{ObservationSource, RuleBackend, StoredEntry, StoredVersion, VersionId};
use crate::config::{RuleEncoding, StoreConfig};
use crate::error::StoreError;

fn version_key(key: &str) -> String {
    format!("{}:version", key)
}

fn query_hash_key(namespace: &str, id: &str) -> String {
    format!("{}:query:{}", namespace, id)
}

/// Connected Redis backend. One connection per session.
pub struct RedisBackend {
    con: Connection,
    max_attempts: u32,
}

impl RedisBackend {
    /// Connects using `config`, with connect and socket timeouts applied.
    pub fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
            redis: RedisConnectionInfo {
                db: 0,
                username: Some(config.user.clone()),
                password: config.password.clone(),
                ..Default::default()
            },
        };

        let client = Client::open(info)?;
        let con = client.get_connection_with_timeout(config.timeout)?;
        con.set_read_timeout(Some(config.timeout))?;
        con.set_write_timeout(Some(config.timeout))?;
        debug!("Connected to {}", config.address());

        Ok(Self {
            con,
            max_attempts: config.max_commit_attempts.max(1),
        })
    }

    pub fn ping(&mut self) -> Result<(), StoreError> {
        redis::cmd("PING").query::<String>(&mut self.con)?;
        Ok(())
    }

    fn unwatch(&mut self) {
        if let Err(e) = redis::cmd("UNWATCH").query::<()>(&mut self.con) {
            warn!("UNWATCH failed: {}", e);
        }
    }

    fn read_stream(&mut self, key: &str) -> Result<Option<StoredVersion>, StoreError> {
        let entries: Vec<(String, Vec<String>)> = redis::cmd("XREVRANGE")
            .arg(key)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query(&mut self.con)?;

        let Some((id, flat)) = entries.into_iter().next() else {
            return Ok(None);
        };
        if flat.len() % 2 != 0 {
            warn!("Stream entry {} has an odd number of field values; last one dropped", id);
        }
        let fields = flat
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();

        Ok(Some(StoredVersion {
            id: VersionId(id),
            entry: StoredEntry::Fields(fields),
        }))
    }

    fn read_document(&mut self, key: &str) -> Result<Option<StoredVersion>, StoreError> {
        let (doc, version): (Option<String>, Option<String>) = redis::pipe()
            .cmd("JSON.GET")
            .arg(key)
            .cmd("GET")
            .arg(version_key(key))
            .query(&mut self.con)?;

        Ok(doc.map(|doc| StoredVersion {
            // documents written before versioning was introduced count as version 0
            id: VersionId(version.unwrap_or_else(|| "0".to_string())),
            entry: StoredEntry::Document(doc),
        }))
    }
}

impl RuleBackend for RedisBackend {
    fn read_latest(
        &mut self,
        key: &str,
        encoding: RuleEncoding,
    ) -> Result<Option<StoredVersion>, StoreError> {
        match encoding {
            RuleEncoding::Stream => self.read_stream(key),
            RuleEncoding::Document => self.read_document(key),
        }
    }

    fn read_then_write(
        &mut self,
        key: &str,
        encoding: RuleEncoding,
        decide: &mut dyn FnMut(Option<&StoredVersion>) -> Result<StoredEntry, StoreError>,
    ) -> Result<VersionId, StoreError> {
        let watched = match encoding {
            RuleEncoding::Stream => vec![key.to_string()],
            RuleEncoding::Document => vec![key.to_string(), version_key(key)],
        };
        let max_attempts = self.max_attempts;
        retry_commit(max_attempts, key, || {
            self.commit_once(key, encoding, &watched, &mut *decide)
        })
    }
}

impl RedisBackend {
    /// One WATCH / read / decide / MULTI..EXEC round. `None` means EXEC was
    /// aborted because a watched key changed.
    fn commit_once(
        &mut self,
        key: &str,
        encoding: RuleEncoding,
        watched: &[String],
        decide: &mut dyn FnMut(Option<&StoredVersion>) -> Result<StoredEntry, StoreError>,
    ) -> Result<Option<VersionId>, StoreError> {
        redis::cmd("WATCH").arg(watched).query::<()>(&mut self.con)?;

        let current = match self.read_latest(key, encoding) {
            Ok(current) => current,
            Err(e) => {
                self.unwatch();
                return Err(e);
            }
        };
        let entry = match decide(current.as_ref()) {
            Ok(entry) => entry,
            Err(e) => {
                self.unwatch();
                return Err(e);
            }
        };

        let mut pipe = redis::pipe();
        pipe.atomic();
        match &entry {
            StoredEntry::Fields(fields) => {
                pipe.cmd("XADD").arg(key).arg("*").arg(fields);
            }
            StoredEntry::Document(doc) => {
                pipe.cmd("JSON.SET")
                    .arg(key)
                    .arg("$")
                    .arg(doc)
                    .ignore()
                    .cmd("INCR")
                    .arg(version_key(key));
            }
        }

        // EXEC replies nil when a watched key changed
        let replies: Option<Vec<Value>> = pipe.query(&mut self.con)?;
        let Some(replies) = replies else {
            return Ok(None);
        };

        let reply = replies
            .first()
            .ok_or_else(|| StoreError::Observation("empty transaction reply".to_string()))?;
        let id = match entry {
            StoredEntry::Fields(_) => redis::from_redis_value::<String>(reply)?,
            StoredEntry::Document(_) => redis::from_redis_value::<i64>(reply)?.to_string(),
        };
        Ok(Some(VersionId(id)))
    }
}

/// Runs `attempt` until it returns a version or an error. Gives up with
/// `Contention` once `max_attempts` rounds were aborted.
fn retry_commit<F>(max_attempts: u32, key: &str, mut attempt: F) -> Result<VersionId, StoreError>
where
    F: FnMut() -> Result<Option<VersionId>, StoreError>,
{
    let max_attempts = max_attempts.max(1);
    for n in 1..=max_attempts {
        match attempt()? {
            Some(version) => return Ok(version),
            None => warn!("Rule list {} changed during commit (attempt {}), retrying", key, n),
        }
    }
    Err(StoreError::Contention {
        attempts: max_attempts,
    })
}

fn sample_value(sample: &[Value]) -> Result<f64, StoreError> {
    let raw = sample
        .get(1)
        .ok_or_else(|| StoreError::Observation("time series has no samples".to_string()))?;
    let text: String = redis::from_redis_value(raw)?;
    text.parse()
        .map_err(|_| StoreError::Observation(format!("non-numeric sample '{}'", text)))
}

impl ObservationSource for RedisBackend {
    fn observed_queries(&mut self, namespace: &str) -> Result<Vec<ObservedQuery>, StoreError> {
        let series: Vec<(String, Vec<(String, String)>, Vec<Value>)> = redis::cmd("TS.MGET")
            .arg("WITHLABELS")
            .arg("FILTER")
            .arg("name=query")
            .arg("stat=(count,mean)")
            .query(&mut self.con)?;

        let mut stats: BTreeMap<String, (u64, f64)> = BTreeMap::new();
        for (key, labels, sample) in series {
            let labels: HashMap<String, String> = labels.into_iter().collect();
            let Some(id) = labels.get("id") else {
                warn!("Skipping time series {} without an id label", key);
                continue;
            };
            if sample.is_empty() {
                continue;
            }
            let entry = stats.entry(id.clone()).or_insert((0, 0.0));
            match labels.get("stat").map(String::as_str) {
                Some("count") => entry.0 = sample_value(&sample)?.max(0.0).round() as u64,
                Some("mean") => entry.1 = sample_value(&sample)?,
                _ => {}
            }
        }

        let mut pipe = redis::pipe();
        for id in stats.keys() {
            pipe.hgetall(query_hash_key(namespace, id));
        }
        let details: Vec<HashMap<String, String>> = if stats.is_empty() {
            Vec::new()
        } else {
            pipe.query(&mut self.con)?
        };

        Ok(stats
            .into_iter()
            .zip(details)
            .map(|((id, (count, mean)), mut detail)| ObservedQuery {
                id,
                table_csv: detail.remove("table").unwrap_or_default(),
                sql: detail.remove("sql").unwrap_or_default(),
                count,
                mean_latency: mean,
            })
            .collect())
    }

    fn clear_metrics(&mut self, namespace: &str) -> Result<u64, StoreError> {
        let ids: Vec<String> = self
            .observed_queries(namespace)?
            .into_iter()
            .map(|q| q.id)
            .collect();

        let mut cleared = 0u64;
        for id in ids {
            let keys: Vec<String> = redis::cmd("TS.QUERYINDEX")
                .arg(format!("id={}", id))
                .query(&mut self.con)?;
            if keys.is_empty() {
                continue;
            }
            let mut pipe = redis::pipe();
            for key in &keys {
                pipe.cmd("TS.DEL").arg(key).arg(0).arg(i64::MAX);
            }
            let removed: Vec<u64> = pipe.query(&mut self.con)?;
            cleared += removed.iter().sum::<u64>();
        }
        debug!("Cleared {} samples for {}", cleared, namespace);
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_commit_gives_up_with_contention() {
        let mut calls = 0;
        let result = retry_commit(3, "app:config", || {
            calls += 1;
            Ok(None)
        });
        assert!(matches!(result, Err(StoreError::Contention { attempts: 3 })));
        assert!(result.unwrap_err().is_out_of_sync());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_commit_succeeds_after_aborted_round() {
        let mut calls = 0;
        let version = retry_commit(5, "app:config", || {
            calls += 1;
            Ok((calls == 2).then(|| VersionId("7-0".to_string())))
        })
        .unwrap();
        assert_eq!(version.as_str(), "7-0");
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_retry_commit_stops_on_error() {
        let mut calls = 0;
        let result = retry_commit(5, "app:config", || {
            calls += 1;
            Err(StoreError::OutOfSync { index: 4, len: 1 })
        });
        assert!(matches!(result, Err(StoreError::OutOfSync { index: 4, len: 1 })));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let mut calls = 0;
        let _ = retry_commit(0, "app:config", || {
            calls += 1;
            Ok(None)
        });
        assert_eq!(calls, 1);
    }
}
