use serde::Deserialize;

use super::{Check, parse_fields};
use crate::context::RunContext;
use crate::error::DefinitionError;
use crate::model::{CheckMeta, CheckResult};

const KIND: &str = "noop";

/// Fields of a no-op definition; both are echoed back in the result
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct NoopFields {
    dynamic: String,
    r#static: String,
}

/// Always passes. Useful for exercising templating and the pipeline.
#[derive(Debug, Default)]
pub struct NoopCheck {
    meta: CheckMeta,
    fields: NoopFields,
}

#[async_trait::async_trait]
impl Check for NoopCheck {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn meta(&self) -> &CheckMeta {
        &self.meta
    }

    fn init(&mut self, meta: CheckMeta, definition: &str) -> Result<(), DefinitionError> {
        self.meta = meta;
        self.fields = parse_fields(&self.meta, KIND, definition)?;
        Ok(())
    }

    async fn run(&self, _ctx: &RunContext) -> CheckResult {
        CheckResult::new(&self.meta, KIND).success(format!(
            "Static: {}, Dynamic: {}",
            self.fields.r#static, self.fields.dynamic
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DEFAULT_CONNECT_TIMEOUT;
    use std::time::Duration;

    #[tokio::test]
    async fn test_noop_echoes_fields() {
        let mut check = NoopCheck::default();
        check
            .init(
                CheckMeta { id: "n1".to_string(), ..CheckMeta::default() },
                r#"{"Static": "s", "Dynamic": "d"}"#,
            )
            .unwrap();

        let ctx = RunContext::standalone(Duration::from_secs(1), DEFAULT_CONNECT_TIMEOUT);
        let result = check.run(&ctx).await;

        assert!(result.passed());
        assert_eq!(result.message, "Static: s, Dynamic: d");
        assert_eq!(result.id, "n1");
        assert_eq!(result.check_type, "noop");
    }

    #[test]
    fn test_noop_rejects_malformed_json() {
        let mut check = NoopCheck::default();
        let error = check.init(CheckMeta::default(), "{not json").unwrap_err();
        assert!(matches!(error, DefinitionError::Parse { .. }));
    }
}
