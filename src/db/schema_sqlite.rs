// SQLite schema definitions
// This file mirrors schema.rs but uses SQLite-compatible types

diesel::table! {
    room_mappings (id) {
        id -> Integer,
        remote_room_id -> Text,
        matrix_room_id -> Text,
        kind -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    virtual_users (id) {
        id -> Integer,
        remote_user_id -> Text,
        matrix_user_id -> Text,
        display_name -> Nullable<Text>,
        avatar_url -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(room_mappings, virtual_users);
