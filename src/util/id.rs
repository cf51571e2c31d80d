use uuid::Uuid;

pub fn request_id() -> String {
    format!("gen-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_and_prefixed() {
        let a = request_id();
        let b = request_id();
        assert!(a.starts_with("gen-"));
        assert_ne!(a, b);
    }
}
