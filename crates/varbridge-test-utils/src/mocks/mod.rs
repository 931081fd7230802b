//! Mock implementations of the collaborator traits.

use async_trait::async_trait;
use mockall::mock;

use varbridge_core::{PropagationRequest, Propagator, VarResult};

// Generate the mock implementation for Propagator
mock! {
    pub Propagator {}

    #[async_trait]
    impl Propagator for Propagator {
        async fn propagate(&self, request: PropagationRequest) -> VarResult<()>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use varbridge_core::{SessionId, VarError, VariableId, VariableValue};

    fn request(version: u64) -> PropagationRequest {
        PropagationRequest {
            session_id: SessionId::from("s"),
            changed: VariableId("var_a".to_string()),
            value: VariableValue::Float(1.0),
            version,
            order: vec![VariableId("var_a".to_string())],
        }
    }

    #[tokio::test]
    async fn test_mock_propagator_expectations() {
        let mut propagator = MockPropagator::new();
        propagator
            .expect_propagate()
            .withf(|request| request.version == 3)
            .times(1)
            .returning(|_| Ok(()));
        propagator
            .expect_propagate()
            .returning(|_| Err(VarError::Other("evaluator offline".to_string())));

        assert!(propagator.propagate(request(3)).await.is_ok());
        assert!(propagator.propagate(request(4)).await.is_err());
    }
}
