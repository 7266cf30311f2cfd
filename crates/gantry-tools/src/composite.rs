use crate::definition::ToolDefinition;
use crate::executor::{ToolCallRequest, ToolError, ToolExecutor, ToolOutput};

/// Chains two `ToolExecutor` implementations with first-match-wins dispatch.
///
/// Tries `first`, falls through to `second` if it returns `Ok(None)`.
/// Errors from `first` propagate immediately without trying `second`.
#[derive(Debug)]
pub struct CompositeExecutor<A: ToolExecutor, B: ToolExecutor> {
    first: A,
    second: B,
}

impl<A: ToolExecutor, B: ToolExecutor> CompositeExecutor<A, B> {
    #[must_use]
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A: ToolExecutor, B: ToolExecutor> ToolExecutor for CompositeExecutor<A, B> {
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = self.first.tool_definitions();
        defs.extend(self.second.tool_definitions());
        defs
    }

    async fn execute_tool_call(
        &self,
        call: &ToolCallRequest,
    ) -> Result<Option<ToolOutput>, ToolError> {
        if let Some(output) = self.first.execute_tool_call(call).await? {
            return Ok(Some(output));
        }
        self.second.execute_tool_call(call).await
    }
}
