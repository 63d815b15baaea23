//! Metrics and structured logs emitted by the coordinator.
//!
//! One-shot events implement [`InternalEvent`] and are emitted by value. Events that
//! fire on every state change are registered once and keep their metric handles
//! (see [`registered_event!`]).
//!
//! | Metric | Kind | Labels |
//! |--------|------|--------|
//! | `chat_requests_accepted_total` | counter | `placement` (`running`, `queued`, `sequential`) |
//! | `chat_requests_rejected_total` | counter | `reason` |
//! | `chat_requests_finished_total` | counter | `status` |
//! | `chat_request_retries_total` | counter | |
//! | `chat_fallback_activations_total` | counter | |
//! | `chat_session_stale_writes_total` | counter | |
//! | `chat_requests_running` | gauge | |
//! | `chat_requests_queued` | gauge | |
//! | `chat_request_processing_seconds` | histogram | |

pub trait InternalEvent: Sized {
    fn emit(self);
}

pub trait RegisterInternalEvent: Sized {
    type Handle: InternalEventHandle;

    fn register(self) -> Self::Handle;
}

pub trait InternalEventHandle: Sized {
    type Data: Sized;

    fn emit(&self, data: Self::Data);
}

/// Declares an event whose metric handles are resolved once, at registration.
///
/// ```ignore
/// registered_event! {
///     QueueDepth => {
///         depth: Gauge = gauge!("queue_depth"),
///     }
///
///     fn emit(&self, depth: usize) {
///         self.depth.set(depth as f64);
///     }
/// }
/// ```
macro_rules! registered_event {
    (
        $event:ident => {
            $( $field:ident: $type:ty = $value:expr, )*
        }

        fn emit(&$slf:ident, $data_name:ident: $data:ty)
            $emit_body:block
    ) => {
        paste::paste! {
            #[derive(Debug, Clone, Copy, PartialEq, Eq)]
            pub struct $event;

            #[derive(Clone)]
            pub struct [<$event Handle>] {
                $( $field: $type, )*
            }

            impl $crate::coordination::internal_event::RegisterInternalEvent for $event {
                type Handle = [<$event Handle>];

                fn register(self) -> Self::Handle {
                    [<$event Handle>] {
                        $( $field: $value, )*
                    }
                }
            }

            impl $crate::coordination::internal_event::InternalEventHandle for [<$event Handle>] {
                type Data = $data;

                fn emit(&$slf, $data_name: $data) $emit_body
            }
        }
    };
}

pub(crate) use registered_event;

mod chat;

pub use self::chat::*;
