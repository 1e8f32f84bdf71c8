//! Resource tag constants
//!
//! Every resource this tool creates (or adopts without a name) is tagged
//! with an ownership marker so it can be discovered and cleaned up later.
//!
//! | Tag Key    | Description                                 |
//! |------------|---------------------------------------------|
//! | `owner`    | Static ownership marker ("batchrig")        |
//! | `Name`     | The resource's human-assigned name          |
//! | `vpc-name` | On subnets, the name of the owning VPC      |

/// Tag key for the ownership marker
pub const TAG_OWNER: &str = "owner";

/// Tag value for the ownership marker
pub const TAG_OWNER_VALUE: &str = "batchrig";

/// Tag key for the resource name (the key AWS consoles display)
pub const TAG_NAME: &str = "Name";

/// Tag key linking a subnet to its owning VPC
pub const TAG_VPC_NAME: &str = "vpc-name";

/// Synthetic name back-filled onto adopted VPCs that carry no Name tag
pub const ADOPTED_VPC_NAME: &str = "batchrig-adopted-vpc";

/// Ownership marker plus a Name tag.
pub fn name_tags(name: &str) -> [(&str, &str); 2] {
    [(TAG_OWNER, TAG_OWNER_VALUE), (TAG_NAME, name)]
}
