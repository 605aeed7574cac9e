/*!

This is the long-form manual for `meek_stv` and `astra-elections`.

## Counting rules

The count follows the Meek method of the single transferable vote.

**Quota** The quota is the total weight of the counted ballots divided by the number
of seats plus one. It is not rounded: with 5 votes and 2 seats, the quota is 5/3.

**Retention factors** Every candidate keeps a fraction of the votes that reach it. This
fraction starts at 1. Each ballot is walked in order of preference: the next continuing
candidate receives everything left on the ballot, keeps its fraction of it, and the rest
moves on to the next preference. Once a candidate is elected, its fraction is lowered to
`quota / received` so that it keeps the quota and nothing more. The surplus flows down
to the later preferences of its voters.

The count repeats this distribution until the fractions stop moving (the largest change
is below `epsilon`, 10^-28 by default).

**Election** A candidate is elected as soon as its retained total reaches the quota.
At most the number of remaining seats is filled in one iteration. When several
candidates reach the quota together, they are taken by decreasing total.

**Elimination** When the fractions stopped moving and nobody reached the quota, the
eligible candidate with the lowest retained total is eliminated. Its votes flow to the
next preferences.

**Remaining seats** As soon as there are no more eligible candidates than seats left,
all of them are elected, whatever their totals. The round records say so explicitly:
these candidates did not reach the quota.

## Exclusion groups

An exclusion group caps the number of winners among a set of candidates. When a group
reaches its maximum, its other members are excluded immediately, even if they reached
the quota in the same iteration. The exclusion is attributed to the winner that filled
the group, and it is reported separately from eliminations.

## Ties

Ties are broken by applying these rules in order until one candidate is left:

1. the retained total at the end of the previous iteration
2. the total offered to the candidate in the current iteration
3. the first-preference votes
4. the tie-break identifier assigned to the candidate when it was created

The highest value wins when ordering winners, the lowest value loses when eliminating.
The identifiers are unique, so the last rule always settles the tie. Every rule that
was applied is kept in the round record, with the values it compared.

## Precision

All the quantities are exact decimals with 48 digits after the decimal point. Products
and quotients are truncated. The same ballots always give the same digits, and round
records can be checked independently.

## Input file for `astra-elections tally`

```json
{
  "name": "Board election",
  "seats": 2,
  "candidates": [
    {"id": 1, "name": "Alice", "tiebreakUuid": "00000000-0000-0000-0000-000000000001"},
    {"id": 2, "name": "Bob", "tiebreakUuid": "00000000-0000-0000-0000-000000000002"}
  ],
  "exclusionGroups": [
    {"publicId": "officers", "name": "Officers", "maxElected": 1, "candidateIds": [1, 2]}
  ],
  "ballots": [
    {"ranking": [1, 2], "weight": 3}
  ],
  "rules": {"epsilon": "1e-28", "maxIterations": 200}
}
```

`exclusionGroups` and `rules` are optional.

## Settings

The `--settings` file of `astra-elections simulate`:

* `minMembershipAgeDays` (number, default 90): how long a membership must have existed
  before the start of the election to grant a vote.
* `publicBaseUrl` (string): the address used in the links sent to voters.
* `tallyEpsilon` (string, default `"1e-28"`), `tallyMaxIterations` (number, default 200).

 */
