use easel_common::types::Canvas;

/// True iff `identity` owns the canvas or is in its shared list.
///
/// Always evaluated against the snapshot at hand; a user removed from the
/// shared list loses access on their next action.
pub fn authorize(canvas: &Canvas, identity: &str) -> bool {
    canvas.is_owner(identity) || canvas.is_shared_with(identity)
}

/// Only the owner may share, unshare or delete.
pub fn is_owner(canvas: &Canvas, identity: &str) -> bool {
    canvas.is_owner(identity)
}
