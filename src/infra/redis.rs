//! Redis-backed [`KvStore`].

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use redis::{RedisError, Value};
use tracing::debug;

use crate::cache::kv::{Command, KvError, KvStore, Order, Pipeline, Replies, Reply, ttl_seconds};

use super::error::InfraError;

#[derive(Clone)]
pub struct RedisKv {
    pool: Pool,
}

impl RedisKv {
    pub fn connect(url: &str, pool_size: usize) -> Result<Self, InfraError> {
        let mut config = Config::from_url(url);
        config.pool = Some(PoolConfig::new(pool_size));
        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|err| InfraError::redis("pool creation", err))?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<(), InfraError> {
        let mut connection = self
            .pool
            .get()
            .await
            .map_err(|err| InfraError::redis("connection checkout", err))?;
        redis::cmd("PING")
            .query_async::<String>(&mut connection)
            .await
            .map(|_| ())
            .map_err(|err| InfraError::redis("health check", err))
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn execute(&self, pipeline: Pipeline) -> Result<Replies, KvError> {
        if pipeline.is_empty() {
            return Ok(Replies::default());
        }

        let atomic = pipeline.is_atomic();
        let commands = pipeline.into_commands();
        let mut pipe = redis::pipe();
        if atomic {
            pipe.atomic();
        }

        // Commands with a fixed answer (DEL of nothing) are not sent.
        let mut fixed: Vec<Option<Reply>> = Vec::with_capacity(commands.len());
        for command in &commands {
            match encode(command) {
                Some(cmd) => {
                    pipe.add_command(cmd);
                    fixed.push(None);
                }
                None => fixed.push(Some(Reply::Int(0))),
            }
        }

        let sent = fixed.iter().filter(|reply| reply.is_none()).count();
        let values = if sent == 0 {
            Vec::new()
        } else {
            let mut connection = self
                .pool
                .get()
                .await
                .map_err(|err| KvError::connection(err.to_string()))?;
            pipe.query_async::<Vec<Value>>(&mut connection)
                .await
                .map_err(map_redis_error)?
        };
        let mut values = values.into_iter();

        debug!(commands = commands.len(), sent, atomic, "executed redis pipeline");

        let mut replies = Vec::with_capacity(fixed.len());
        for slot in fixed {
            match slot {
                Some(reply) => replies.push(reply),
                None => {
                    let value = values.next().ok_or(KvError::MissingReply {
                        index: replies.len(),
                    })?;
                    replies.push(into_reply(value));
                }
            }
        }
        Ok(Replies::new(replies))
    }
}

fn encode(command: &Command) -> Option<redis::Cmd> {
    let cmd = match command {
        Command::Get { key } => {
            let mut cmd = redis::cmd("GET");
            cmd.arg(key);
            cmd
        }
        Command::SetEx { key, value, ttl } => {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key)
                .arg(value.as_ref())
                .arg("EX")
                .arg(ttl_seconds(*ttl));
            cmd
        }
        Command::SetNxEx { key, value, ttl } => {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key)
                .arg(value.as_ref())
                .arg("NX")
                .arg("EX")
                .arg(ttl_seconds(*ttl));
            cmd
        }
        Command::IncrBy { key, delta } => {
            let mut cmd = redis::cmd("INCRBY");
            cmd.arg(key).arg(*delta);
            cmd
        }
        Command::Del { keys } => {
            if keys.is_empty() {
                return None;
            }
            let mut cmd = redis::cmd("DEL");
            cmd.arg(keys);
            cmd
        }
        Command::Expire { key, ttl } => {
            let mut cmd = redis::cmd("EXPIRE");
            cmd.arg(key).arg(ttl_seconds(*ttl));
            cmd
        }
        Command::SAdd { key, member } => key_member("SADD", key, member),
        Command::SRem { key, member } => key_member("SREM", key, member),
        Command::SMembers { key } => {
            let mut cmd = redis::cmd("SMEMBERS");
            cmd.arg(key);
            cmd
        }
        Command::SIsMember { key, member } => key_member("SISMEMBER", key, member),
        Command::HSet { key, field, value } => {
            let mut cmd = redis::cmd("HSET");
            cmd.arg(key).arg(field).arg(*value);
            cmd
        }
        Command::HIncrBy { key, field, delta } => {
            let mut cmd = redis::cmd("HINCRBY");
            cmd.arg(key).arg(field).arg(*delta);
            cmd
        }
        Command::HGetAll { key } => {
            let mut cmd = redis::cmd("HGETALL");
            cmd.arg(key);
            cmd
        }
        Command::HDel { key, field } => key_member("HDEL", key, field),
        Command::ZAdd { key, member, score } => {
            let mut cmd = redis::cmd("ZADD");
            cmd.arg(key).arg(*score).arg(member);
            cmd
        }
        Command::ZIncrBy { key, member, delta } => {
            let mut cmd = redis::cmd("ZINCRBY");
            cmd.arg(key).arg(*delta).arg(member);
            cmd
        }
        Command::ZRange {
            key,
            start,
            stop,
            order,
        } => {
            let mut cmd = redis::cmd(match order {
                Order::Asc => "ZRANGE",
                Order::Desc => "ZREVRANGE",
            });
            cmd.arg(key).arg(*start).arg(*stop).arg("WITHSCORES");
            cmd
        }
        Command::ZRemRangeByRank { key, start, stop } => {
            let mut cmd = redis::cmd("ZREMRANGEBYRANK");
            cmd.arg(key).arg(*start).arg(*stop);
            cmd
        }
        Command::ZScan { key, cursor, count } => {
            let mut cmd = redis::cmd("ZSCAN");
            cmd.arg(key).arg(*cursor).arg("COUNT").arg(*count);
            cmd
        }
        Command::ZScore { key, member } => key_member("ZSCORE", key, member),
        Command::ZRem { key, member } => key_member("ZREM", key, member),
    };
    Some(cmd)
}

fn key_member(name: &str, key: &str, member: &str) -> redis::Cmd {
    let mut cmd = redis::cmd(name);
    cmd.arg(key).arg(member);
    cmd
}

fn into_reply(value: Value) -> Reply {
    match value {
        Value::Nil => Reply::Nil,
        Value::Okay => Reply::Ok,
        Value::Int(value) => Reply::Int(value),
        Value::Double(value) => Reply::Double(value),
        Value::Boolean(value) => Reply::Int(i64::from(value)),
        Value::BulkString(bytes) => Reply::Data(Bytes::from(bytes)),
        Value::SimpleString(text) if text == "OK" => Reply::Ok,
        Value::SimpleString(text) => Reply::Data(Bytes::from(text)),
        Value::Array(items) | Value::Set(items) => {
            Reply::Array(items.into_iter().map(into_reply).collect())
        }
        Value::Map(pairs) => Reply::Array(
            pairs
                .into_iter()
                .flat_map(|(field, value)| [into_reply(field), into_reply(value)])
                .collect(),
        ),
        _ => Reply::Nil,
    }
}

fn map_redis_error(err: RedisError) -> KvError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        KvError::connection(err.to_string())
    } else {
        KvError::command(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn empty_delete_is_answered_locally() {
        let command = Command::Del { keys: Vec::new() };
        assert!(encode(&command).is_none());
    }

    #[test]
    fn set_carries_expiry_in_whole_seconds() {
        let command = Command::SetEx {
            key: "k".to_string(),
            value: Bytes::from_static(b"v"),
            ttl: Duration::from_millis(1500),
        };
        let cmd = encode(&command).expect("encodable");
        let packed = String::from_utf8_lossy(&cmd.get_packed_command()).into_owned();
        assert!(packed.contains("EX"));
        assert!(packed.contains("\r\n1\r\n"));
    }

    #[test]
    fn conditional_set_sends_nx_before_expiry() {
        let command = Command::SetNxEx {
            key: "lock".to_string(),
            value: Bytes::from_static(b"1"),
            ttl: Duration::from_secs(30),
        };
        let cmd = encode(&command).expect("encodable");
        let packed = String::from_utf8_lossy(&cmd.get_packed_command()).into_owned();
        assert!(packed.contains("NX\r\n$2\r\nEX\r\n$2\r\n30"));
    }

    #[test]
    fn resp3_maps_flatten_like_resp2() {
        let value = Value::Map(vec![(
            Value::BulkString(b"rust".to_vec()),
            Value::Int(3),
        )]);
        assert_eq!(
            into_reply(value),
            Reply::Array(vec![Reply::Data(Bytes::from_static(b"rust")), Reply::Int(3)])
        );
    }
}
