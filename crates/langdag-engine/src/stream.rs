use futures::StreamExt;

use langdag_core::error::{LangdagError, Result};
use langdag_core::event::EventSender;
use langdag_core::traits::Provider;
use langdag_core::types::{CompletionRequest, CompletionResponse, ProviderEvent};

/// Send an event unless the worker has been cancelled first.
pub(crate) async fn send_or_cancel<E: Send>(tx: &EventSender<E>, event: E) -> Result<()> {
    tokio::select! {
        sent = tx.send(event) => {
            if sent { Ok(()) } else { Err(LangdagError::Cancelled) }
        }
        _ = tx.cancel_token().cancelled() => Err(LangdagError::Cancelled),
    }
}

/// Stream a completion, forwarding each text delta through `tx`.
///
/// Returns the final response only when the provider reports `Done`. A
/// provider error, a stream that ends early, cancellation, or a consumer
/// that went away all yield `Err`.
pub(crate) async fn stream_completion<E, F>(
    provider: &dyn Provider,
    request: CompletionRequest,
    tx: &EventSender<E>,
    to_event: F,
) -> Result<CompletionResponse>
where
    E: Send,
    F: Fn(String) -> E,
{
    let cancel = tx.cancel_token().clone();

    let mut stream = tokio::select! {
        result = provider.stream(request) => result?,
        _ = cancel.cancelled() => return Err(LangdagError::Cancelled),
    };

    loop {
        let event = tokio::select! {
            event = stream.next() => event,
            _ = cancel.cancelled() => return Err(LangdagError::Cancelled),
        };

        match event {
            Some(ProviderEvent::Delta(text)) => send_or_cancel(tx, to_event(text)).await?,
            Some(ProviderEvent::Done(response)) => return Ok(response),
            Some(ProviderEvent::Error(e)) => return Err(e),
            Some(ProviderEvent::Start) | Some(ProviderEvent::ContentDone(_)) => {}
            None => {
                return Err(LangdagError::ProviderStream(
                    "stream ended without a final response".into(),
                ))
            }
        }
    }
}

/// Batch completion that gives up on cancellation.
pub(crate) async fn complete_or_cancel<E: Send>(
    provider: &dyn Provider,
    request: CompletionRequest,
    tx: &EventSender<E>,
) -> Result<CompletionResponse> {
    tokio::select! {
        result = provider.complete(request) => result,
        _ = tx.cancel_token().cancelled() => Err(LangdagError::Cancelled),
    }
}
