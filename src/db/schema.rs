diesel::table! {
    room_mappings (id) {
        id -> BigInt,
        remote_room_id -> Text,
        matrix_room_id -> Text,
        kind -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    virtual_users (id) {
        id -> BigInt,
        remote_user_id -> Text,
        matrix_user_id -> Text,
        display_name -> Nullable<Text>,
        avatar_url -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(room_mappings, virtual_users);
