/*!
Organizational elections counted with Meek STV.

The [`elections`] module holds the election lifecycle, the voting credentials,
the ballot submission pipeline and its hash-chained ledger. The count itself is
done by the [`meek_stv`] crate.
*/

pub mod elections;
