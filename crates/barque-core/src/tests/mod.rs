mod backup_roundtrip;
mod layered_stack;
