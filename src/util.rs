pub(crate) fn is_false(b: &bool) -> bool {
    !(*b)
}
