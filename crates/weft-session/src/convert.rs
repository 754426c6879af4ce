//! Value conversion layer.
//!
//! An explicit recursive walk over the closed set of container shapes
//! (array, keyed map, scalar) with two stream-specific substitutions:
//!
//! - outbound (`convert`): a live stream leaf is registered in the exposed
//!   table and replaced by its reference token
//! - inbound (`unconvert`): a reference token is replaced by the local proxy
//!   for that id
//!
//! Because the walk recurses through arbitrary nesting, streams travel "by
//! reference" at any depth of call arguments, results, and stream payloads
//! without call sites writing any transport code.

use tracing::warn;
use weft_wire::Value;

use crate::registry::Registry;
use crate::subject::{as_stream, stream_value};

impl Registry {
    /// Prepare a value for the wire: every live stream leaf becomes a
    /// reference token; the rest is a structural clone.
    pub fn convert(&self, value: Value) -> Value {
        match value {
            Value::Stream(_) => match as_stream(&value) {
                Some(subject) => Value::StreamRef(self.register_exposed(subject)),
                None => {
                    warn!("stream slot of unknown type dropped during conversion");
                    Value::Null
                }
            },
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.convert(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.convert(v)))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Resolve a value off the wire: every reference token becomes the local
    /// proxy stream for that id.
    pub fn unconvert(&self, value: Value) -> Value {
        match value {
            Value::StreamRef(id) => stream_value(self.proxy(&id)),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.unconvert(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.unconvert(v)))
                    .collect(),
            ),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::subject;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    fn registry() -> (Registry, mpsc::UnboundedReceiver<weft_wire::Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Registry::new(tx), rx)
    }

    #[tokio::test]
    async fn scalars_pass_through_unchanged() {
        let (reg, _rx) = registry();
        for v in [Value::Null, Value::from(false), Value::from(0), Value::from("")] {
            assert_eq!(reg.convert(v.clone()), v);
            assert_eq!(reg.unconvert(v.clone()), v);
        }
    }

    #[tokio::test]
    async fn deeply_nested_streams_are_substituted() {
        let (reg, _rx) = registry();
        let (_p1, s1) = subject();
        let (_p2, s2) = subject();
        let mut inner = BTreeMap::new();
        inner.insert("stream".to_string(), stream_value(s1));
        inner.insert("n".to_string(), Value::from(1));
        let value = Value::Array(vec![
            Value::Object(inner),
            Value::Array(vec![stream_value(s2)]),
            Value::from("plain"),
        ]);

        let converted = reg.convert(value);
        assert_eq!(reg.stats().exposed, 2);

        let outer = converted.as_array().unwrap();
        let map = outer[0].as_object().unwrap();
        assert!(map["stream"].as_stream_ref().is_some());
        assert_eq!(map["n"], Value::from(1));
        assert!(outer[1].as_array().unwrap()[0].as_stream_ref().is_some());
        assert_eq!(outer[2], Value::from("plain"));
    }

    #[tokio::test]
    async fn unconvert_resolves_tokens_to_proxies() {
        let (reg, _rx) = registry();
        let value = Value::Array(vec![
            Value::StreamRef("a".to_string()),
            Value::Array(vec![Value::StreamRef("b".to_string())]),
        ]);
        let resolved = reg.unconvert(value);
        let items = resolved.as_array().unwrap();
        assert!(as_stream(&items[0]).is_some());
        assert!(as_stream(&items[1].as_array().unwrap()[0]).is_some());
        assert_eq!(reg.stats().proxies, 2);
    }
}
