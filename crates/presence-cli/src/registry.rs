//! Demonstration service: a name registry.

use async_trait::async_trait;
use presence_core::{Dispatch, RemoteFault, ServiceDescriptor};
use serde_json::{Map, Value};
use tracing::info;

pub struct Registry;

impl Registry {
    pub fn service_descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new("Registry", ["register", "test"])
    }
}

#[async_trait]
impl Dispatch for Registry {
    fn descriptor(&self) -> ServiceDescriptor {
        Registry::service_descriptor()
    }

    async fn dispatch(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, RemoteFault> {
        match method {
            "register" => {
                let name = args
                    .first()
                    .or_else(|| kwargs.get("name"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        RemoteFault::new("TypeError", "register() requires a string 'name'")
                    })?;
                info!("Registering {}", name);
                Ok(Value::Bool(true))
            }
            "test" => Err(RemoteFault::new("NameError", "blah")),
            other => Err(RemoteFault::unknown_method("Registry", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_accepts_positional_or_keyword_name() {
        let positional = Registry
            .dispatch("register", vec![json!("test")], Map::new())
            .await;
        assert_eq!(positional, Ok(json!(true)));

        let mut kwargs = Map::new();
        kwargs.insert("name".to_string(), json!("test"));
        let keyword = Registry.dispatch("register", Vec::new(), kwargs).await;
        assert_eq!(keyword, Ok(json!(true)));
    }

    #[tokio::test]
    async fn test_register_without_name_is_type_error() {
        let fault = Registry
            .dispatch("register", Vec::new(), Map::new())
            .await
            .unwrap_err();
        assert_eq!(fault.kind, "TypeError");
    }

    #[tokio::test]
    async fn test_always_raises_name_error() {
        let fault = Registry.dispatch("test", Vec::new(), Map::new()).await.unwrap_err();
        assert_eq!(fault, RemoteFault::new("NameError", "blah"));
    }
}
