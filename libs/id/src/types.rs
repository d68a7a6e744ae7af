//! Identifier types used across the scheduler.

use crate::define_id;

// A launched control-plane or worker task. Assigned once and reused when a
// task is relaunched in place.
define_id!(TaskId, "task");

// One subscription to the resource manager, from SUBSCRIBE to stream end.
define_id!(SessionId, "sess");

// Admin API request, echoed back in problem details.
define_id!(RequestId, "req");
